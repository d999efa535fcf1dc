//! The session facade tying reads, writes, and background sync together.
//!
//! [`SyncEngine`] owns the session store, the snapshot cache, the executor
//! with its category slots, and lazily connected per-chain clients. Habit
//! traffic always routes to the habit chain; task traffic follows the
//! session's chain. Writes flow submit, settle, reconcile: the executor
//! broadcasts, the confirmation watcher tracks the receipt, and the
//! refresh worker folds the confirmed state back into the cache.

use crate::{
    cache::{SessionStore, SnapshotCache},
    client::LedgerClient,
    config::EngineConfig,
    error::EngineError,
    executor::{required_chain, LedgerWriter, PendingOperation, SigningClient, TxExecutor},
    gateway::{EntityGateway, EntityReader},
    history::{HistoryEntry, TxHistory},
    invalidator::{EventInvalidator, Invalidation, RefreshWorker},
    streak::{compute_streak, streak_from_logs, StreakSummary},
    sync::EntitySync,
    watcher::{ConfirmationWatcher, TxOutcome},
    SessionContext,
};
use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use chainflow_primitives::{current_day_index, Habit, HabitCategory, HabitStats, Task, TaskStats};
use chainflow_registry::{abi::Action, resolve, EntityKind};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Pending invalidations beyond this depth coalesce into whatever refresh
/// is already queued.
const REFRESH_QUEUE_DEPTH: usize = 16;

/// Handle to the background tasks spawned for a session.
#[derive(Debug)]
pub struct BackgroundHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Stops event polling and the refresh worker.
    pub fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Whether every background task has exited.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}

/// Client-side synchronization engine for one wallet session.
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<SessionStore>,
    cache: Arc<SnapshotCache>,
    sync: Arc<EntitySync>,
    history: Arc<TxHistory>,
    executor: TxExecutor,
    watcher: ConfirmationWatcher,
    invalidations: mpsc::Sender<Invalidation>,
    refresh_rx: Mutex<Option<mpsc::Receiver<Invalidation>>>,
    clients: RwLock<HashMap<u64, Arc<LedgerClient>>>,
    readers: RwLock<HashMap<u64, Arc<dyn EntityReader>>>,
    writers: RwLock<HashMap<u64, Arc<dyn LedgerWriter>>>,
    signer: RwLock<Option<PrivateKeySigner>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("store_entries", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Creates an engine with an empty in-memory session store.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(SessionStore::default()))
    }

    /// Creates an engine over an existing store, typically one restored
    /// from a snapshot file.
    pub fn with_store(config: EngineConfig, store: Arc<SessionStore>) -> Self {
        let cache = Arc::new(SnapshotCache::new(Arc::clone(&store), config.cache_ttl));
        let sync = Arc::new(EntitySync::new(Arc::clone(&cache), config.clone()));
        let history = Arc::new(TxHistory::new(Arc::clone(&store), config.history_cap));
        let (invalidations, refresh_rx) = mpsc::channel(REFRESH_QUEUE_DEPTH);
        let watcher = ConfirmationWatcher::new(
            Arc::clone(&cache),
            Arc::clone(&history),
            invalidations.clone(),
            config.clone(),
        );
        let executor = TxExecutor::new(config.clone());
        Self {
            config,
            store,
            cache,
            sync,
            history,
            executor,
            watcher,
            invalidations,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            clients: RwLock::new(HashMap::new()),
            readers: RwLock::new(HashMap::new()),
            writers: RwLock::new(HashMap::new()),
            signer: RwLock::new(None),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The backing session store, for snapshot and restore.
    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    // Wallet lifecycle.

    /// Installs the signing key for this session and returns its address.
    /// Replacing the key drops any writers built for the previous one.
    pub fn connect_wallet(&self, signer: PrivateKeySigner) -> Address {
        let address = signer.address();
        self.writers.write().clear();
        *self.signer.write() = Some(signer);
        debug!(target: "chainflow::engine", %address, "wallet connected");
        address
    }

    /// Address of the installed signing key, if any.
    pub fn wallet_address(&self) -> Option<Address> {
        self.signer.read().as_ref().map(PrivateKeySigner::address)
    }

    /// Ends the session: drops the key and writers, clears cached entity
    /// lists, and wipes the account's transaction log.
    pub fn disconnect(&self, account: Address) {
        *self.signer.write() = None;
        self.writers.write().clear();
        self.cache.invalidate_all();
        self.history.clear(account);
        debug!(target: "chainflow::engine", %account, "session cleared");
    }

    // Per-chain resolution. Clients connect on first use and are reused
    // for the rest of the session.

    async fn client_for(&self, chain_id: u64) -> Result<Arc<LedgerClient>, EngineError> {
        if let Some(client) = self.clients.read().get(&chain_id) {
            return Ok(Arc::clone(client));
        }
        let profile = resolve(chain_id);
        if !profile.supported {
            return Err(EngineError::UnsupportedNetwork { chain_id });
        }
        let client = Arc::new(
            LedgerClient::connect_with_failover(&profile).await.map_err(EngineError::Ledger)?,
        );
        let mut clients = self.clients.write();
        let entry = clients.entry(chain_id).or_insert(client);
        Ok(Arc::clone(entry))
    }

    async fn reader_for(&self, chain_id: u64) -> Result<Arc<dyn EntityReader>, EngineError> {
        if let Some(reader) = self.readers.read().get(&chain_id) {
            return Ok(Arc::clone(reader));
        }
        let client = self.client_for(chain_id).await?;
        let gateway: Arc<dyn EntityReader> =
            Arc::new(EntityGateway::new(resolve(chain_id), client));
        let mut readers = self.readers.write();
        let entry = readers.entry(chain_id).or_insert(gateway);
        Ok(Arc::clone(entry))
    }

    async fn writer_for(&self, chain_id: u64) -> Result<Arc<dyn LedgerWriter>, EngineError> {
        if let Some(writer) = self.writers.read().get(&chain_id) {
            return Ok(Arc::clone(writer));
        }
        let signer = self.signer.read().clone().ok_or(EngineError::WalletRequired)?;
        let client = self.client_for(chain_id).await?;
        let signing: Arc<dyn LedgerWriter> = Arc::new(SigningClient::new(client, signer));
        let mut writers = self.writers.write();
        let entry = writers.entry(chain_id).or_insert(signing);
        Ok(Arc::clone(entry))
    }

    /// Substitutes the reader for a chain. Reads for that chain never
    /// touch the network afterwards.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn install_reader(&self, chain_id: u64, reader: Arc<dyn EntityReader>) {
        self.readers.write().insert(chain_id, reader);
    }

    /// Substitutes the writer for a chain.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn install_writer(&self, chain_id: u64, writer: Arc<dyn LedgerWriter>) {
        self.writers.write().insert(chain_id, writer);
    }

    // Entity reads.

    /// The session's habit list, served from cache when fresh.
    pub async fn habits(&self, ctx: &SessionContext) -> Result<Vec<Habit>, EngineError> {
        let reader = self.reader_for(required_chain(EntityKind::Habits, ctx)).await?;
        self.sync.habits(reader.as_ref(), ctx, false).await
    }

    /// Forces a habit re-sync, bypassing the cache.
    pub async fn refresh_habits(&self, ctx: &SessionContext) -> Result<Vec<Habit>, EngineError> {
        let reader = self.reader_for(required_chain(EntityKind::Habits, ctx)).await?;
        self.sync.habits(reader.as_ref(), ctx, true).await
    }

    /// The session's task list for its chain, served from cache when fresh.
    pub async fn tasks(&self, ctx: &SessionContext) -> Result<Vec<Task>, EngineError> {
        let reader = self.reader_for(ctx.chain_id).await?;
        self.sync.tasks(reader.as_ref(), ctx, false).await
    }

    /// Forces a task re-sync, bypassing the cache.
    pub async fn refresh_tasks(&self, ctx: &SessionContext) -> Result<Vec<Task>, EngineError> {
        let reader = self.reader_for(ctx.chain_id).await?;
        self.sync.tasks(reader.as_ref(), ctx, true).await
    }

    /// Aggregates over the synced habit list.
    pub async fn habit_stats(&self, ctx: &SessionContext) -> Result<HabitStats, EngineError> {
        Ok(HabitStats::collect(&self.habits(ctx).await?))
    }

    /// Aggregates over the synced task list.
    pub async fn task_stats(&self, ctx: &SessionContext) -> Result<TaskStats, EngineError> {
        Ok(TaskStats::collect(&self.tasks(ctx).await?))
    }

    /// Loads one habit by index with its streak derived, or `None` when
    /// the index is past the contract's count.
    pub async fn habit_by_index(
        &self,
        ctx: &SessionContext,
        index: u64,
    ) -> Result<Option<Habit>, EngineError> {
        let reader = self.reader_for(required_chain(EntityKind::Habits, ctx)).await?;
        let count = reader.habit_count().await?;
        if index >= count {
            return Ok(None);
        }
        let mut habit = reader.habit(index).await?;
        let summary =
            compute_streak(reader.as_ref(), index, self.config.streak_horizon_days).await;
        habit.streak = summary.streak;
        habit.total_checkins = summary.total_checkins;
        habit.last_checked_in_day = summary.last_checked_in_day;
        Ok(Some(habit))
    }

    /// Loads one task by index, or `None` when the index is past the
    /// contract's count.
    pub async fn task_by_index(
        &self,
        ctx: &SessionContext,
        index: u64,
    ) -> Result<Option<Task>, EngineError> {
        let reader = self.reader_for(ctx.chain_id).await?;
        let count = reader.task_count().await?;
        if index >= count {
            return Ok(None);
        }
        Ok(Some(reader.task(index).await?))
    }

    /// Whether the habit was checked in today. Indexes past the count
    /// read as not checked in rather than erroring.
    pub async fn is_checked_in_today(
        &self,
        ctx: &SessionContext,
        habit_id: u64,
    ) -> Result<bool, EngineError> {
        let reader = self.reader_for(required_chain(EntityKind::Habits, ctx)).await?;
        let count = reader.habit_count().await?;
        if habit_id >= count {
            return Ok(false);
        }
        reader.is_checked_in(habit_id, current_day_index()).await
    }

    /// Derives a habit's streak from its historical check-in events
    /// instead of per-day reads. Needs an endpoint that serves logs from
    /// the contract's deployment block.
    pub async fn streak_from_history(
        &self,
        ctx: &SessionContext,
        habit_id: u64,
    ) -> Result<StreakSummary, EngineError> {
        let chain_id = required_chain(EntityKind::Habits, ctx);
        let client = self.client_for(chain_id).await?;
        let profile = resolve(chain_id);
        streak_from_logs(&client, &profile, ctx.account, habit_id, self.config.streak_horizon_days)
            .await
    }

    // Writes.

    /// Sequences, signs, and broadcasts an action, recording it in the
    /// transaction log. Fails fast when the wallet is missing, the chain
    /// is wrong for the action, or the action's category already has an
    /// operation in flight.
    pub async fn submit_action(
        &self,
        ctx: &SessionContext,
        action: Action,
    ) -> Result<PendingOperation, EngineError> {
        let required = required_chain(action.entity_kind(), ctx);
        if !resolve(required).supported {
            return Err(EngineError::UnsupportedNetwork { chain_id: required });
        }
        if ctx.chain_id != required {
            return Err(EngineError::NetworkSwitchRequired { current: ctx.chain_id, required });
        }
        let writer = self.writer_for(required).await?;
        let op = self.executor.execute(writer.as_ref(), ctx, &action).await?;
        self.history.record_submitted(
            op.account,
            op.tx_hash,
            op.function,
            &op.description,
            op.chain_id,
        );
        Ok(op)
    }

    /// Submits a habit creation.
    pub async fn create_habit(
        &self,
        ctx: &SessionContext,
        name: &str,
        description: &str,
        category: &str,
    ) -> Result<PendingOperation, EngineError> {
        self.submit_action(ctx, Action::CreateHabit {
            name: name.to_owned(),
            description: description.to_owned(),
            category: HabitCategory::from(category),
        })
        .await
    }

    /// Submits a check-in for the current day.
    pub async fn check_in_today(
        &self,
        ctx: &SessionContext,
        habit_id: u64,
    ) -> Result<PendingOperation, EngineError> {
        self.submit_action(ctx, Action::CheckIn { habit_id, day_index: current_day_index() })
            .await
    }

    /// Tracks a broadcast operation to a terminal outcome, reconciling
    /// cache, history, and the category slot.
    pub async fn settle(&self, op: PendingOperation) -> Result<TxOutcome, EngineError> {
        let writer = self.writer_for(op.chain_id).await?;
        Ok(self.watcher.settle(writer.as_ref(), &self.executor, op).await)
    }

    /// Submits an action and settles it inline.
    pub async fn submit_and_settle(
        &self,
        ctx: &SessionContext,
        action: Action,
    ) -> Result<(PendingOperation, TxOutcome), EngineError> {
        let op = self.submit_action(ctx, action).await?;
        let outcome = self.settle(op.clone()).await?;
        Ok((op, outcome))
    }

    /// Settles an operation on a spawned task so the caller can return
    /// immediately. If tracking cannot start, the category slot is freed
    /// and the log entry stays `Submitted`.
    pub fn spawn_settlement(self: &Arc<Self>, op: PendingOperation) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let category = op.category;
            let tx_hash = op.tx_hash;
            if let Err(err) = engine.settle(op).await {
                warn!(target: "chainflow::engine", %tx_hash, %err, "settlement tracking aborted");
                engine.executor.clear(category);
            }
        })
    }

    /// Operations currently awaiting confirmation.
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.executor.in_flight()
    }

    /// The account's transaction log, newest first.
    pub fn transaction_log(&self, account: Address) -> Vec<HistoryEntry> {
        self.history.entries(account)
    }

    // Background sync.

    /// Queues a forced refresh of one entity list. A full queue means a
    /// refresh is already pending and the request folds into it.
    pub fn request_refresh(&self, kind: EntityKind) {
        let _ = self.invalidations.try_send(Invalidation { kind, expect_new: false });
    }

    /// Starts the refresh worker and, unless `event_poll_interval` is
    /// zero, an event poller per chain the session touches. Can only be
    /// started once per engine.
    pub async fn spawn_background(
        &self,
        ctx: &SessionContext,
    ) -> Result<BackgroundHandle, EngineError> {
        let habit_chain = required_chain(EntityKind::Habits, ctx);
        let habit_reader = self.reader_for(habit_chain).await?;
        let task_reader = self.reader_for(ctx.chain_id).await?;

        let rx = self
            .refresh_rx
            .lock()
            .take()
            .ok_or_else(|| EngineError::Unknown("background sync is already running".to_owned()))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if !self.config.event_poll_interval.is_zero() {
            let mut chains = vec![habit_chain];
            if ctx.chain_id != habit_chain {
                chains.push(ctx.chain_id);
            }
            for chain_id in chains {
                match self.client_for(chain_id).await {
                    Ok(client) => {
                        let invalidator = Arc::new(EventInvalidator::new(
                            client,
                            resolve(chain_id),
                            self.invalidations.clone(),
                            self.config.clone(),
                        ));
                        tasks.push(tokio::spawn(invalidator.run(shutdown_rx.clone())));
                    }
                    Err(err) => {
                        warn!(target: "chainflow::engine", chain_id, %err, "event polling unavailable");
                    }
                }
            }
        }

        let worker = RefreshWorker::new(
            Arc::clone(&self.sync),
            Arc::clone(&self.cache),
            habit_reader,
            task_reader,
            *ctx,
            rx,
        );
        tasks.push(tokio::spawn(worker.run()));

        debug!(
            target: "chainflow::engine",
            account = %ctx.account,
            chain_id = ctx.chain_id,
            pollers = tasks.len() - 1,
            "background sync started"
        );
        Ok(BackgroundHandle { shutdown, tasks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{history::HistoryStatus, mock::MockLedger};
    use alloy_primitives::address;
    use assert_matches::assert_matches;
    use chainflow_registry::{BASE_MAINNET, SOMNIA_TESTNET};
    use std::time::Duration;

    const ACCOUNT: Address = address!("00000000000000000000000000000000000000aa");

    fn test_config() -> EngineConfig {
        EngineConfig {
            settle_delay: Duration::from_millis(1),
            receipt_poll_interval: Duration::from_millis(1),
            receipt_timeout: Duration::from_millis(50),
            creation_refresh_delay: Duration::from_millis(1),
            read_retry_delay: Duration::from_millis(1),
            event_poll_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn engine_with_ledger(ledger: &Arc<MockLedger>) -> Arc<SyncEngine> {
        let engine = Arc::new(SyncEngine::new(test_config()));
        engine.install_reader(SOMNIA_TESTNET, Arc::clone(ledger) as Arc<dyn EntityReader>);
        engine.install_writer(SOMNIA_TESTNET, Arc::clone(ledger) as Arc<dyn LedgerWriter>);
        engine
    }

    #[tokio::test]
    async fn wallet_is_required_before_any_write() {
        let engine = SyncEngine::new(test_config());
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        let result = engine
            .submit_action(&ctx, Action::CheckIn { habit_id: 0, day_index: 1 })
            .await;
        assert_matches!(result, Err(EngineError::WalletRequired));
    }

    #[tokio::test]
    async fn chain_guard_runs_before_the_wallet_guard() {
        let engine = SyncEngine::new(test_config());
        let ctx = SessionContext::new(ACCOUNT, BASE_MAINNET);

        // No wallet is installed, yet a habit write from the wrong chain
        // must surface the switch request, not the missing wallet.
        let result = engine.create_habit(&ctx, "run", "", "fitness").await;
        assert_matches!(
            result,
            Err(EngineError::NetworkSwitchRequired { current: BASE_MAINNET, required: SOMNIA_TESTNET })
        );
    }

    #[tokio::test]
    async fn write_settles_and_reconciles_through_the_facade() {
        let ledger = Arc::new(MockLedger::new());
        let engine = engine_with_ledger(&ledger);
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        ledger.push_habit("run", "", "fitness", ACCOUNT);

        let op = engine.create_habit(&ctx, "run", "5k", "fitness").await.unwrap();
        assert_eq!(engine.pending_operations().len(), 1);
        let log = engine.transaction_log(ACCOUNT);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, HistoryStatus::Submitted);
        assert_eq!(log[0].function, "createHabit");

        let outcome = engine.settle(op).await.unwrap();
        assert!(outcome.is_confirmed());
        assert!(engine.pending_operations().is_empty());
        assert_eq!(engine.transaction_log(ACCOUNT)[0].status, HistoryStatus::Confirmed);

        // Confirmation queued a growth refresh for the habit list.
        let mut rx = engine.refresh_rx.lock().take().unwrap();
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.kind, EntityKind::Habits);
        assert!(queued.expect_new);
    }

    #[tokio::test]
    async fn point_lookups_validate_against_the_count() {
        let ledger = Arc::new(MockLedger::new());
        let engine = engine_with_ledger(&ledger);
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        ledger.push_habit("run", "", "fitness", ACCOUNT);

        let habit = engine.habit_by_index(&ctx, 0).await.unwrap();
        assert_eq!(habit.map(|h| h.name), Some("run".to_owned()));
        assert!(engine.habit_by_index(&ctx, 5).await.unwrap().is_none());

        // An out-of-range check-in probe reads as unchecked, not as an
        // error.
        assert!(!engine.is_checked_in_today(&ctx, 99).await.unwrap());
    }

    #[tokio::test]
    async fn disconnect_clears_cache_and_log() {
        let ledger = Arc::new(MockLedger::new());
        let engine = engine_with_ledger(&ledger);
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        ledger.push_habit("run", "", "fitness", ACCOUNT);
        let op = engine.create_habit(&ctx, "run", "", "fitness").await.unwrap();
        engine.settle(op).await.unwrap();
        engine.habits(&ctx).await.unwrap();
        assert!(!engine.session_store().is_empty());

        engine.disconnect(ACCOUNT);
        assert!(engine.wallet_address().is_none());
        assert!(engine.transaction_log(ACCOUNT).is_empty());
        // Only the transaction log key may remain, and disconnect wiped
        // that too.
        assert!(engine.session_store().is_empty());

        // The next read goes back to the ledger.
        let before = ledger.reads().habit_count;
        engine.habits(&ctx).await.unwrap();
        assert_eq!(ledger.reads().habit_count, before + 1);
    }

    #[tokio::test]
    async fn background_worker_consumes_refresh_requests() {
        let ledger = Arc::new(MockLedger::new());
        let engine = engine_with_ledger(&ledger);
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        ledger.push_habit("run", "", "fitness", ACCOUNT);

        let handle = engine.spawn_background(&ctx).await.unwrap();
        assert_matches!(
            engine.spawn_background(&ctx).await,
            Err(EngineError::Unknown(_))
        );

        engine.request_refresh(EntityKind::Habits);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ledger.reads().habit_count >= 1);

        handle.stop();
    }
}
