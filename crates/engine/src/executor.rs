//! Write-path execution with explicit sequencing.
//!
//! Every mutation follows the same recipe: resolve the deployment, check
//! the session can act, fetch the pending nonce, estimate gas with a 1.5x
//! buffer, fetch the gas price, then sign and broadcast with every field
//! explicit. Nothing is left for the node to infer, which keeps rapid
//! successive writes from racing each other's nonces.
//!
//! One operation per category may be in flight at a time. The slot fills
//! when the transaction is accepted and empties when the confirmation
//! watcher settles it, or immediately on a failed send.

use crate::{
    client::{LedgerClient, ReceiptInfo},
    config::EngineConfig,
    error::EngineError,
    SessionContext,
};
use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, TxHash, TxKind};
use alloy_rpc_types::{TransactionInput, TransactionRequest};
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use chainflow_primitives::now_ms;
use chainflow_registry::{abi, Action, EntityKind, SOMNIA_TESTNET};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::debug;

/// Concurrency category of a write. Operations of different categories may
/// overlap; operations of the same category may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCategory {
    /// Entity creation.
    Create,
    /// Progress marks: habit check-ins and task submissions.
    Progress,
    /// Creator-side confirmations.
    Confirm,
}

impl OpCategory {
    /// Category of an action.
    pub fn of(action: &Action) -> Self {
        match action {
            Action::CreateHabit { .. } | Action::CreateTask { .. } => Self::Create,
            Action::CheckIn { .. } | Action::SubmitTask { .. } => Self::Progress,
            Action::VerifyTask { .. } => Self::Confirm,
        }
    }
}

impl fmt::Display for OpCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Progress => "progress",
            Self::Confirm => "confirm",
        };
        f.write_str(name)
    }
}

/// A transaction that has been accepted by an endpoint but not yet settled.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    /// Concurrency category holding the slot.
    pub category: OpCategory,
    /// Entity kind the write targets.
    pub kind: EntityKind,
    /// Contract function that was called.
    pub function: &'static str,
    /// Human-readable description of the action.
    pub description: String,
    /// Hash of the broadcast transaction.
    pub tx_hash: TxHash,
    /// Chain the transaction was sent to.
    pub chain_id: u64,
    /// Account that signed it.
    pub account: Address,
    /// Submission time in unix milliseconds.
    pub submitted_at_ms: u64,
    /// Whether confirmation should grow the entity list, in which case the
    /// forced refresh retries until the new entity appears.
    pub expects_new_entity: bool,
}

/// Write access to the ledger. The production implementation signs with a
/// local key and broadcasts; tests substitute a scripted one.
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Next nonce for the account, mempool included.
    async fn pending_nonce(&self, account: Address) -> Result<u64>;

    /// Gas estimate for the call.
    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64>;

    /// Current gas price.
    async fn gas_price(&self) -> Result<u128>;

    /// Signs and broadcasts, returning the transaction hash.
    async fn submit(&self, tx: TransactionRequest) -> Result<TxHash>;

    /// Receipt for a broadcast transaction, if mined.
    async fn receipt(&self, hash: TxHash) -> Result<Option<ReceiptInfo>>;
}

/// [`LedgerWriter`] over a [`LedgerClient`] and a local signing key.
pub struct SigningClient {
    client: Arc<LedgerClient>,
    wallet: alloy_network::EthereumWallet,
    address: Address,
}

impl fmt::Debug for SigningClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningClient")
            .field("address", &self.address)
            .field("chain_id", &self.client.chain_id())
            .finish_non_exhaustive()
    }
}

impl SigningClient {
    /// Pairs a chain client with a signing key.
    pub fn new(client: Arc<LedgerClient>, signer: PrivateKeySigner) -> Self {
        let address = signer.address();
        Self { client, wallet: alloy_network::EthereumWallet::from(signer), address }
    }

    /// Address of the signing key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The underlying chain client.
    pub fn client(&self) -> &Arc<LedgerClient> {
        &self.client
    }
}

#[async_trait]
impl LedgerWriter for SigningClient {
    async fn pending_nonce(&self, account: Address) -> Result<u64> {
        self.client.get_pending_nonce(account).await
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64> {
        self.client.estimate_gas(tx).await
    }

    async fn gas_price(&self) -> Result<u128> {
        self.client.get_gas_price().await
    }

    async fn submit(&self, tx: TransactionRequest) -> Result<TxHash> {
        let envelope =
            tx.build(&self.wallet).await.with_context(|| "Failed to sign transaction")?;
        self.client.send_envelope(envelope).await
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<ReceiptInfo>> {
        Ok(self.client.get_transaction_receipt(hash).await?.map(|r| ReceiptInfo::from(&r)))
    }
}

/// Chain a write must run on. Habits live on a single deployment; tasks
/// follow the session's chain.
pub(crate) fn required_chain(kind: EntityKind, ctx: &SessionContext) -> u64 {
    match kind {
        EntityKind::Habits => SOMNIA_TESTNET,
        EntityKind::Tasks => ctx.chain_id,
    }
}

/// Sequenced transaction executor.
#[derive(Debug)]
pub struct TxExecutor {
    config: EngineConfig,
    // None marks a slot reserved by an execute call that has not produced
    // a hash yet.
    pending: Mutex<HashMap<OpCategory, Option<PendingOperation>>>,
}

impl TxExecutor {
    /// Creates an executor with the given tuning.
    pub fn new(config: EngineConfig) -> Self {
        Self { config, pending: Mutex::new(HashMap::new()) }
    }

    /// The operation currently holding a category's slot, if it has been
    /// broadcast already.
    pub fn pending(&self, category: OpCategory) -> Option<PendingOperation> {
        self.pending.lock().get(&category).and_then(|slot| slot.clone())
    }

    /// Every broadcast operation still holding a slot.
    pub fn in_flight(&self) -> Vec<PendingOperation> {
        self.pending.lock().values().filter_map(|slot| slot.clone()).collect()
    }

    /// Releases a category's slot once its operation settles.
    pub(crate) fn clear(&self, category: OpCategory) {
        self.pending.lock().remove(&category);
    }

    /// Runs the full write sequence for `action` and returns the pending
    /// operation on acceptance.
    ///
    /// All session guards run before the first ledger interaction: an
    /// unsupported or mismatched chain and a busy category slot are decided
    /// without spending a single request.
    pub async fn execute(
        &self,
        writer: &dyn LedgerWriter,
        ctx: &SessionContext,
        action: &Action,
    ) -> Result<PendingOperation, EngineError> {
        let kind = action.entity_kind();
        let category = OpCategory::of(action);

        let required = required_chain(kind, ctx);
        let profile = chainflow_registry::resolve(required);
        if !profile.supported {
            return Err(EngineError::UnsupportedNetwork { chain_id: required });
        }
        if ctx.chain_id != required {
            return Err(EngineError::NetworkSwitchRequired {
                current: ctx.chain_id,
                required,
            });
        }

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&category) {
                return Err(EngineError::OperationInFlight { category });
            }
            pending.insert(category, None);
        }

        let result = self.sequence_and_submit(writer, ctx, action, kind, category, profile).await;
        match result {
            Ok(op) => {
                self.pending.lock().insert(category, Some(op.clone()));
                Ok(op)
            }
            Err(err) => {
                self.pending.lock().remove(&category);
                Err(err)
            }
        }
    }

    async fn sequence_and_submit(
        &self,
        writer: &dyn LedgerWriter,
        ctx: &SessionContext,
        action: &Action,
        kind: EntityKind,
        category: OpCategory,
        profile: chainflow_registry::ChainProfile,
    ) -> Result<PendingOperation, EngineError> {
        let to = profile.contract(kind);
        let function = abi::function_name(action);
        let input = abi::encode_action(action);

        let nonce = writer.pending_nonce(ctx.account).await.map_err(EngineError::Ledger)?;

        let base = TransactionRequest {
            from: Some(ctx.account),
            to: Some(TxKind::Call(to)),
            input: TransactionInput::new(input),
            chain_id: Some(profile.chain_id),
            ..Default::default()
        };

        let estimate = writer
            .estimate_gas(&base)
            .await
            .map_err(|err| EngineError::GasEstimationFailed(format!("{err:#}")))?;
        let gas_limit = estimate.saturating_mul(self.config.gas_buffer_tenths) / 10;

        let gas_price = writer.gas_price().await.map_err(EngineError::Ledger)?;

        debug!(
            target: "chainflow::executor",
            function,
            nonce,
            estimate,
            gas_limit,
            gas_price,
            chain_id = profile.chain_id,
            "submitting transaction"
        );

        let request = TransactionRequest {
            nonce: Some(nonce),
            gas: Some(gas_limit),
            gas_price: Some(gas_price),
            ..base
        };
        let tx_hash = writer
            .submit(request)
            .await
            .map_err(|err| EngineError::classify_failure(&format!("{err:#}")))?;

        Ok(PendingOperation {
            category,
            kind,
            function,
            description: action.describe(),
            tx_hash,
            chain_id: profile.chain_id,
            account: ctx.account,
            submitted_at_ms: now_ms(),
            expects_new_entity: matches!(category, OpCategory::Create),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLedger;
    use alloy_primitives::address;
    use assert_matches::assert_matches;
    use chainflow_registry::{resolve, BASE_MAINNET};

    const ACCOUNT: Address = address!("00000000000000000000000000000000000000aa");

    fn checkin() -> Action {
        Action::CheckIn { habit_id: 0, day_index: 20_000 }
    }

    #[tokio::test]
    async fn unsupported_chain_is_rejected_without_ledger_traffic() {
        let ledger = MockLedger::for_chain(4242);
        let executor = TxExecutor::new(EngineConfig::default());
        let ctx = SessionContext::new(ACCOUNT, 4242);

        let err = executor
            .execute(&ledger, &ctx, &Action::CreateTask {
                title: "t".into(),
                description: String::new(),
                assignee: ACCOUNT,
                reward: "1".into(),
            })
            .await
            .unwrap_err();

        assert_matches!(err, EngineError::UnsupportedNetwork { chain_id: 4242 });
        assert_eq!(ledger.writes().total(), 0);
    }

    #[tokio::test]
    async fn habit_writes_demand_the_habit_chain() {
        let ledger = MockLedger::for_chain(BASE_MAINNET);
        let executor = TxExecutor::new(EngineConfig::default());
        let ctx = SessionContext::new(ACCOUNT, BASE_MAINNET);

        let err = executor.execute(&ledger, &ctx, &checkin()).await.unwrap_err();

        assert_matches!(
            err,
            EngineError::NetworkSwitchRequired { current: BASE_MAINNET, required: SOMNIA_TESTNET }
        );
        assert_eq!(ledger.writes().total(), 0);
    }

    #[tokio::test]
    async fn every_sequencing_field_is_explicit() {
        let ledger = MockLedger::new();
        ledger.set_next_nonce(7);
        ledger.set_gas_estimate(100_000);
        let executor = TxExecutor::new(EngineConfig::default());
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        let op = executor.execute(&ledger, &ctx, &checkin()).await.unwrap();
        assert_eq!(op.function, "checkIn");
        assert!(!op.expects_new_entity);

        let submitted = ledger.submitted();
        assert_eq!(submitted.len(), 1);
        let tx = &submitted[0];
        assert_eq!(tx.nonce, Some(7));
        assert_eq!(tx.gas, Some(150_000));
        assert!(tx.gas_price.is_some());
        assert_eq!(tx.chain_id, Some(SOMNIA_TESTNET));
        assert_eq!(tx.from, Some(ACCOUNT));
        let profile = resolve(SOMNIA_TESTNET);
        assert_eq!(tx.to, Some(TxKind::Call(profile.habit_contract)));
    }

    #[tokio::test]
    async fn a_category_admits_one_operation_at_a_time() {
        let ledger = MockLedger::new();
        let executor = TxExecutor::new(EngineConfig::default());
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        executor.execute(&ledger, &ctx, &checkin()).await.unwrap();
        let err = executor
            .execute(&ledger, &ctx, &Action::CheckIn { habit_id: 1, day_index: 20_000 })
            .await
            .unwrap_err();
        assert_matches!(err, EngineError::OperationInFlight { category: OpCategory::Progress });

        // A different category is free to proceed.
        executor
            .execute(&ledger, &ctx, &Action::CreateHabit {
                name: "read".into(),
                description: String::new(),
                category: chainflow_primitives::HabitCategory::Learning,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_sends_free_the_slot_and_classify() {
        let ledger = MockLedger::new();
        ledger.script_submit_error("execution reverted: Already checked in today");
        let executor = TxExecutor::new(EngineConfig::default());
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        let err = executor.execute(&ledger, &ctx, &checkin()).await.unwrap_err();
        assert_matches!(err, EngineError::ContractRejected { .. });
        assert!(err.is_soft());
        assert!(executor.pending(OpCategory::Progress).is_none());

        // The slot is free, so the retry goes straight through.
        executor.execute(&ledger, &ctx, &checkin()).await.unwrap();
    }

    #[tokio::test]
    async fn estimate_failures_surface_as_gas_errors() {
        let ledger = MockLedger::new();
        ledger.script_estimate_error("execution reverted");
        let executor = TxExecutor::new(EngineConfig::default());
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        let err = executor.execute(&ledger, &ctx, &checkin()).await.unwrap_err();
        assert_matches!(err, EngineError::GasEstimationFailed(_));
        assert!(executor.pending(OpCategory::Progress).is_none());
        assert_eq!(ledger.submitted().len(), 0);
    }
}
