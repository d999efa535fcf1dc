//! Event-driven cache invalidation and the single refresh worker.
//!
//! An [`EventInvalidator`] polls the chain for contract events in bounded
//! block windows behind a cursor. Any event touching the session's
//! entities queues an [`Invalidation`]; the confirmation watcher queues
//! the same messages after local writes confirm. One [`RefreshWorker`]
//! consumes the queue and performs forced refreshes, so concurrent
//! invalidations coalesce instead of racing each other through the sync
//! path.

use crate::{
    client::LedgerClient,
    config::EngineConfig,
    error::EngineError,
    gateway::EntityReader,
    sync::EntitySync,
    SessionContext, SnapshotCache,
};
use alloy_rpc_types::{Filter, Log};
use alloy_sol_types::SolEvent;
use chainflow_registry::{
    abi::{CheckedIn, HabitCreated, TaskCreated, TaskSubmitted, TaskVerified},
    ChainProfile, EntityKind,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// A request to re-sync one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    /// Which list to refresh.
    pub kind: EntityKind,
    /// Whether the refresh should insist on a non-empty list, as after a
    /// confirmed creation.
    pub expect_new: bool,
}

/// Maps a contract event to the entity list it staled, if any.
pub fn invalidation_for_log(log: &Log) -> Option<Invalidation> {
    let topic0 = *log.topics().first()?;
    if topic0 == HabitCreated::SIGNATURE_HASH || topic0 == CheckedIn::SIGNATURE_HASH {
        return Some(Invalidation { kind: EntityKind::Habits, expect_new: false });
    }
    if topic0 == TaskCreated::SIGNATURE_HASH ||
        topic0 == TaskSubmitted::SIGNATURE_HASH ||
        topic0 == TaskVerified::SIGNATURE_HASH
    {
        return Some(Invalidation { kind: EntityKind::Tasks, expect_new: false });
    }
    None
}

const CURSOR_UNSET: u64 = u64::MAX;

/// Cursor-based event poller for one chain.
#[derive(Debug)]
pub struct EventInvalidator {
    client: Arc<LedgerClient>,
    profile: ChainProfile,
    cursor: AtomicU64,
    invalidations: mpsc::Sender<Invalidation>,
    config: EngineConfig,
}

impl EventInvalidator {
    /// Creates an invalidator that starts from the chain tip on its first
    /// poll. Historical events are state the next sync reads anyway.
    pub fn new(
        client: Arc<LedgerClient>,
        profile: ChainProfile,
        invalidations: mpsc::Sender<Invalidation>,
        config: EngineConfig,
    ) -> Self {
        Self { client, profile, cursor: AtomicU64::new(CURSOR_UNSET), invalidations, config }
    }

    /// Creates an invalidator replaying from a known block.
    pub fn with_start_block(
        client: Arc<LedgerClient>,
        profile: ChainProfile,
        invalidations: mpsc::Sender<Invalidation>,
        config: EngineConfig,
        start_block: u64,
    ) -> Self {
        Self { client, profile, cursor: AtomicU64::new(start_block), invalidations, config }
    }

    /// Polls one bounded block window and queues an invalidation per
    /// relevant event. Returns how many were queued.
    pub async fn poll_once(&self) -> Result<usize, EngineError> {
        let latest = self.client.get_block_number().await.map_err(EngineError::Ledger)?;

        let cursor = self.cursor.load(Ordering::Relaxed);
        if cursor == CURSOR_UNSET {
            self.cursor.store(latest, Ordering::Relaxed);
            debug!(target: "chainflow::invalidator", chain_id = self.profile.chain_id, latest, "event cursor initialized");
            return Ok(0);
        }

        let to_block = std::cmp::min(cursor.saturating_add(self.config.max_blocks_per_poll), latest);
        if to_block <= cursor {
            return Ok(0);
        }

        let filter = Filter::new()
            .address(vec![self.profile.habit_contract, self.profile.task_contract])
            .event_signature(vec![
                HabitCreated::SIGNATURE_HASH,
                CheckedIn::SIGNATURE_HASH,
                TaskCreated::SIGNATURE_HASH,
                TaskSubmitted::SIGNATURE_HASH,
                TaskVerified::SIGNATURE_HASH,
            ])
            .from_block(cursor + 1)
            .to_block(to_block);

        let logs = self.client.get_logs(&filter).await.map_err(EngineError::Ledger)?;

        let mut queued = 0;
        for log in &logs {
            let Some(message) = invalidation_for_log(log) else { continue };
            match self.invalidations.try_send(message) {
                Ok(()) => queued += 1,
                // A full queue means a refresh is already pending; it will
                // read the state these events produced.
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(EngineError::Unknown("refresh queue closed".to_owned()));
                }
            }
        }

        self.cursor.store(to_block, Ordering::Relaxed);
        if !logs.is_empty() {
            debug!(
                target: "chainflow::invalidator",
                chain_id = self.profile.chain_id,
                from_block = cursor + 1,
                to_block,
                events = logs.len(),
                queued,
                "event poll found activity"
            );
        }
        Ok(queued)
    }

    /// Polls on an interval until shutdown flips. Poll failures are logged
    /// and retried on the next tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.event_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!(target: "chainflow::invalidator", chain_id = self.profile.chain_id, %err, "event poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(target: "chainflow::invalidator", chain_id = self.profile.chain_id, "event invalidator stopping");
                        return;
                    }
                }
            }
        }
    }
}

/// The single consumer of the invalidation queue.
pub struct RefreshWorker {
    sync: Arc<EntitySync>,
    cache: Arc<SnapshotCache>,
    habit_reader: Arc<dyn EntityReader>,
    task_reader: Arc<dyn EntityReader>,
    ctx: SessionContext,
    rx: mpsc::Receiver<Invalidation>,
}

impl std::fmt::Debug for RefreshWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshWorker").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl RefreshWorker {
    /// Creates the worker for one session.
    pub fn new(
        sync: Arc<EntitySync>,
        cache: Arc<SnapshotCache>,
        habit_reader: Arc<dyn EntityReader>,
        task_reader: Arc<dyn EntityReader>,
        ctx: SessionContext,
        rx: mpsc::Receiver<Invalidation>,
    ) -> Self {
        Self { sync, cache, habit_reader, task_reader, ctx, rx }
    }

    /// Drains the queue until every sender is gone. Messages queued while
    /// a refresh runs are coalesced into the next cycle, one refresh per
    /// kind.
    pub async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            let mut habits: Option<bool> = None;
            let mut tasks: Option<bool> = None;
            let mut fold = |message: Invalidation| match message.kind {
                EntityKind::Habits => {
                    habits = Some(habits.unwrap_or(false) || message.expect_new);
                }
                EntityKind::Tasks => {
                    tasks = Some(tasks.unwrap_or(false) || message.expect_new);
                }
            };
            fold(first);
            while let Ok(next) = self.rx.try_recv() {
                fold(next);
            }

            if let Some(expect_new) = habits {
                self.refresh_habits(expect_new).await;
            }
            if let Some(expect_new) = tasks {
                self.refresh_tasks(expect_new).await;
            }
            self.cache.report_metrics();
        }
        debug!(target: "chainflow::invalidator", "refresh worker stopping, queue closed");
    }

    async fn refresh_habits(&self, expect_new: bool) {
        let reader = self.habit_reader.as_ref();
        let result = if expect_new {
            self.sync.habits_expecting_growth(reader, &self.ctx).await
        } else {
            self.sync.habits(reader, &self.ctx, true).await
        };
        if let Err(err) = result {
            warn!(target: "chainflow::invalidator", %err, "forced habit refresh failed");
        }
    }

    async fn refresh_tasks(&self, expect_new: bool) {
        let reader = self.task_reader.as_ref();
        let result = if expect_new {
            self.sync.tasks_expecting_growth(reader, &self.ctx).await
        } else {
            self.sync.tasks(reader, &self.ctx, true).await
        };
        if let Err(err) = result {
            warn!(target: "chainflow::invalidator", %err, "forced task refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::SessionStore, mock::MockLedger};
    use alloy_primitives::{address, Address, Bytes, LogData, B256};
    use chainflow_registry::SOMNIA_TESTNET;
    use std::time::Duration;

    const ACCOUNT: Address = address!("00000000000000000000000000000000000000aa");

    fn log_with_topic(topic0: B256) -> Log {
        Log {
            inner: alloy_primitives::Log {
                address: Address::ZERO,
                data: LogData::new_unchecked(vec![topic0], Bytes::new()),
            },
            ..Default::default()
        }
    }

    #[test]
    fn events_map_to_their_entity_kind() {
        let habit_created = log_with_topic(HabitCreated::SIGNATURE_HASH);
        assert_eq!(
            invalidation_for_log(&habit_created),
            Some(Invalidation { kind: EntityKind::Habits, expect_new: false })
        );

        let verified = log_with_topic(TaskVerified::SIGNATURE_HASH);
        assert_eq!(
            invalidation_for_log(&verified),
            Some(Invalidation { kind: EntityKind::Tasks, expect_new: false })
        );

        let unrelated = log_with_topic(B256::repeat_byte(0x42));
        assert_eq!(invalidation_for_log(&unrelated), None);
    }

    #[tokio::test]
    async fn worker_coalesces_bursts_into_one_refresh_per_kind() {
        let ledger = Arc::new(MockLedger::new());
        ledger.push_habit("a", "", "fitness", ACCOUNT);
        ledger.push_task("t", "1", ACCOUNT, ACCOUNT);

        let config = EngineConfig {
            read_retry_delay: Duration::from_millis(1),
            creation_refresh_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let cache =
            Arc::new(SnapshotCache::new(Arc::new(SessionStore::default()), config.cache_ttl));
        let sync = Arc::new(EntitySync::new(Arc::clone(&cache), config));
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        let (tx, rx) = mpsc::channel(16);
        let worker = RefreshWorker::new(
            sync,
            cache,
            Arc::clone(&ledger) as Arc<dyn EntityReader>,
            Arc::clone(&ledger) as Arc<dyn EntityReader>,
            ctx,
            rx,
        );

        for _ in 0..5 {
            tx.send(Invalidation { kind: EntityKind::Habits, expect_new: false }).await.unwrap();
        }
        tx.send(Invalidation { kind: EntityKind::Tasks, expect_new: false }).await.unwrap();
        drop(tx);

        worker.run().await;

        // The burst of five habit messages collapses into a single forced
        // refresh: one count read for habits, one for tasks.
        assert_eq!(ledger.reads().habit_count, 1);
        assert_eq!(ledger.reads().task_count, 1);
    }

    #[tokio::test]
    async fn growth_messages_win_the_coalesce() {
        let ledger = Arc::new(MockLedger::new());
        ledger.stale_habit_counts(1);
        ledger.push_habit("a", "", "fitness", ACCOUNT);

        let config = EngineConfig {
            read_retry_delay: Duration::from_millis(1),
            creation_refresh_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let cache =
            Arc::new(SnapshotCache::new(Arc::new(SessionStore::default()), config.cache_ttl));
        let sync = Arc::new(EntitySync::new(Arc::clone(&cache), config));
        let ctx = SessionContext::new(ACCOUNT, SOMNIA_TESTNET);

        let (tx, rx) = mpsc::channel(16);
        let worker = RefreshWorker::new(
            sync,
            cache,
            Arc::clone(&ledger) as Arc<dyn EntityReader>,
            Arc::clone(&ledger) as Arc<dyn EntityReader>,
            ctx,
            rx,
        );

        tx.send(Invalidation { kind: EntityKind::Habits, expect_new: false }).await.unwrap();
        tx.send(Invalidation { kind: EntityKind::Habits, expect_new: true }).await.unwrap();
        drop(tx);

        worker.run().await;

        // The stale first count triggered the growth retry loop.
        assert_eq!(ledger.reads().habit_count, 2);
    }
}
