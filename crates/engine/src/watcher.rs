//! Confirmation tracking and post-confirmation reconciliation.
//!
//! After a write is accepted the watcher polls for its receipt until one
//! shows up or the deadline passes. A confirmed receipt settles the
//! operation: the category slot frees, the affected cache entry drops, and
//! after a short settle pause a forced refresh is queued so endpoints that
//! lag the receipt still serve post-transaction state. A missing receipt
//! is reported as timed out, never as failed; the transaction may still
//! land.

use crate::{
    config::EngineConfig,
    error::EngineError,
    executor::{LedgerWriter, PendingOperation, TxExecutor},
    history::{HistoryStatus, TxHistory},
    invalidator::Invalidation,
    SnapshotCache,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{sleep, Instant},
};
use tracing::{debug, warn};

/// Terminal state of a tracked transaction.
#[derive(Debug)]
pub enum TxOutcome {
    /// Receipt observed with success status.
    Confirmed {
        /// Block the transaction landed in, when reported.
        block_number: Option<u64>,
    },
    /// Receipt observed with failure status.
    Failed(EngineError),
    /// No receipt within the deadline. Status unknown.
    TimedOut,
}

impl TxOutcome {
    /// Whether the transaction definitely executed.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// Receipt poller and settlement driver.
#[derive(Debug)]
pub struct ConfirmationWatcher {
    cache: Arc<SnapshotCache>,
    history: Arc<TxHistory>,
    invalidations: mpsc::Sender<Invalidation>,
    config: EngineConfig,
}

impl ConfirmationWatcher {
    /// Creates a watcher that reconciles through `cache` and queues forced
    /// refreshes on `invalidations`.
    pub fn new(
        cache: Arc<SnapshotCache>,
        history: Arc<TxHistory>,
        invalidations: mpsc::Sender<Invalidation>,
        config: EngineConfig,
    ) -> Self {
        Self { cache, history, invalidations, config }
    }

    /// Polls for the operation's receipt until it settles or the deadline
    /// passes. Transient poll failures are retried until the deadline.
    pub async fn await_receipt(
        &self,
        writer: &dyn LedgerWriter,
        op: &PendingOperation,
    ) -> TxOutcome {
        let deadline = Instant::now() + self.config.receipt_timeout;
        loop {
            match writer.receipt(op.tx_hash).await {
                Ok(Some(info)) if info.succeeded => {
                    return TxOutcome::Confirmed { block_number: info.block_number };
                }
                Ok(Some(_)) => {
                    return TxOutcome::Failed(EngineError::ContractRejected {
                        reason: "execution reverted".to_owned(),
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "chainflow::watcher", tx_hash = %op.tx_hash, %err, "receipt poll failed, will retry");
                }
            }
            if Instant::now() >= deadline {
                return TxOutcome::TimedOut;
            }
            sleep(self.config.receipt_poll_interval).await;
        }
    }

    /// Tracks the operation to a terminal state and reconciles local state
    /// with the outcome.
    pub async fn settle(
        &self,
        writer: &dyn LedgerWriter,
        executor: &TxExecutor,
        op: PendingOperation,
    ) -> TxOutcome {
        let outcome = self.await_receipt(writer, &op).await;
        executor.clear(op.category);

        match &outcome {
            TxOutcome::Confirmed { block_number } => {
                debug!(
                    target: "chainflow::watcher",
                    tx_hash = %op.tx_hash,
                    function = op.function,
                    ?block_number,
                    "transaction confirmed"
                );
                self.history.mark(op.account, op.tx_hash, HistoryStatus::Confirmed);
                self.cache.invalidate(op.kind, op.account, op.chain_id);

                sleep(self.config.settle_delay).await;
                let message = Invalidation { kind: op.kind, expect_new: op.expects_new_entity };
                if let Err(err) = self.invalidations.try_send(message) {
                    warn!(target: "chainflow::watcher", %err, "could not queue forced refresh");
                }
            }
            TxOutcome::Failed(error) => {
                if error.is_soft() {
                    debug!(target: "chainflow::watcher", tx_hash = %op.tx_hash, %error, "transaction declined by contract");
                } else {
                    warn!(target: "chainflow::watcher", tx_hash = %op.tx_hash, %error, "transaction failed");
                }
                self.history.mark(op.account, op.tx_hash, HistoryStatus::Failed);
            }
            TxOutcome::TimedOut => {
                warn!(
                    target: "chainflow::watcher",
                    tx_hash = %op.tx_hash,
                    timeout = ?self.config.receipt_timeout,
                    "no receipt before the deadline, outcome unknown"
                );
                self.history.mark(op.account, op.tx_hash, HistoryStatus::TimedOut);
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::SessionStore, executor::OpCategory, mock::MockLedger, SessionContext,
    };
    use alloy_primitives::{address, Address};
    use assert_matches::assert_matches;
    use chainflow_registry::{Action, EntityKind, SOMNIA_TESTNET};
    use std::time::Duration;

    const ACCOUNT: Address = address!("00000000000000000000000000000000000000aa");

    struct Rig {
        cache: Arc<SnapshotCache>,
        history: Arc<TxHistory>,
        executor: TxExecutor,
        watcher: ConfirmationWatcher,
        rx: mpsc::Receiver<Invalidation>,
    }

    fn rig() -> Rig {
        let config = EngineConfig {
            settle_delay: Duration::from_millis(1),
            receipt_poll_interval: Duration::from_millis(1),
            receipt_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let store = Arc::new(SessionStore::default());
        let cache = Arc::new(SnapshotCache::new(Arc::clone(&store), config.cache_ttl));
        let history = Arc::new(TxHistory::new(store, config.history_cap));
        let (tx, rx) = mpsc::channel(16);
        let watcher =
            ConfirmationWatcher::new(Arc::clone(&cache), Arc::clone(&history), tx, config.clone());
        Rig { cache, history, executor: TxExecutor::new(config), watcher, rx }
    }

    fn ctx() -> SessionContext {
        SessionContext::new(ACCOUNT, SOMNIA_TESTNET)
    }

    async fn submit(rig: &Rig, ledger: &MockLedger, action: Action) -> PendingOperation {
        let op = rig.executor.execute(ledger, &ctx(), &action).await.unwrap();
        rig.history.record_submitted(
            op.account,
            op.tx_hash,
            op.function,
            &op.description,
            op.chain_id,
        );
        op
    }

    #[tokio::test]
    async fn confirmation_reconciles_everything() {
        let ledger = MockLedger::new();
        let mut rig = rig();
        let checkin = Action::CheckIn { habit_id: 0, day_index: 20_000 };

        // Seed a cached habit list so invalidation is observable.
        rig.cache.save::<chainflow_primitives::Habit>(
            EntityKind::Habits,
            ACCOUNT,
            SOMNIA_TESTNET,
            &[],
        );

        let op = submit(&rig, &ledger, checkin).await;
        let outcome = rig.watcher.settle(&ledger, &rig.executor, op.clone()).await;

        assert!(outcome.is_confirmed());
        assert!(rig.executor.pending(OpCategory::Progress).is_none());
        assert!(rig
            .cache
            .load::<chainflow_primitives::Habit>(EntityKind::Habits, ACCOUNT, SOMNIA_TESTNET)
            .is_none());
        assert_eq!(rig.history.entries(ACCOUNT)[0].status, HistoryStatus::Confirmed);

        let refresh = rig.rx.try_recv().unwrap();
        assert_eq!(refresh.kind, EntityKind::Habits);
        assert!(!refresh.expect_new);
    }

    #[tokio::test]
    async fn creations_queue_a_growth_refresh() {
        let ledger = MockLedger::new();
        let mut rig = rig();
        let create = Action::CreateHabit {
            name: "read".into(),
            description: String::new(),
            category: chainflow_primitives::HabitCategory::Learning,
        };

        let op = submit(&rig, &ledger, create).await;
        rig.watcher.settle(&ledger, &rig.executor, op).await;

        let refresh = rig.rx.try_recv().unwrap();
        assert!(refresh.expect_new);
    }

    #[tokio::test]
    async fn reverted_receipts_settle_as_failed_without_refresh() {
        let ledger = MockLedger::new();
        ledger.set_auto_confirm(false);
        let mut rig = rig();

        let op = submit(&rig, &ledger, Action::CheckIn { habit_id: 0, day_index: 1 }).await;
        ledger.script_failed_receipt(op.tx_hash);

        rig.cache.save::<chainflow_primitives::Habit>(
            EntityKind::Habits,
            ACCOUNT,
            SOMNIA_TESTNET,
            &[],
        );

        let outcome = rig.watcher.settle(&ledger, &rig.executor, op).await;

        assert_matches!(outcome, TxOutcome::Failed(EngineError::ContractRejected { .. }));
        assert!(rig.executor.pending(OpCategory::Progress).is_none());
        assert!(rig
            .cache
            .load::<chainflow_primitives::Habit>(EntityKind::Habits, ACCOUNT, SOMNIA_TESTNET)
            .is_some());
        assert!(rig.rx.try_recv().is_err());
        assert_eq!(rig.history.entries(ACCOUNT)[0].status, HistoryStatus::Failed);
    }

    #[tokio::test]
    async fn a_missing_receipt_times_out_as_unknown() {
        let ledger = MockLedger::new();
        ledger.set_auto_confirm(false);
        let mut rig = rig();

        let op = submit(&rig, &ledger, Action::CheckIn { habit_id: 0, day_index: 1 }).await;
        let outcome = rig.watcher.settle(&ledger, &rig.executor, op).await;

        assert_matches!(outcome, TxOutcome::TimedOut);
        assert!(rig.executor.pending(OpCategory::Progress).is_none());
        assert!(rig.rx.try_recv().is_err());
        assert_eq!(rig.history.entries(ACCOUNT)[0].status, HistoryStatus::TimedOut);
    }

    #[tokio::test]
    async fn transient_poll_failures_do_not_settle_the_outcome() {
        let ledger = MockLedger::new();
        ledger.fail_next_receipt_reads(2);
        let mut rig = rig();

        let op = submit(&rig, &ledger, Action::CheckIn { habit_id: 0, day_index: 1 }).await;
        let outcome = rig.watcher.settle(&ledger, &rig.executor, op).await;

        assert!(outcome.is_confirmed());
        assert!(ledger.writes().receipts >= 3);
        let _ = rig.rx.try_recv();
    }
}
