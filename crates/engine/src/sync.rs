//! Entity list synchronization.
//!
//! A refresh reads the contract's entity count, loads each entity by index,
//! keeps the ones relevant to the session account and derives habit streaks
//! before the list is cached and returned. Deployments with a batched ABI
//! replace the count-and-index walk with a single range read. A failed
//! entity read skips that entity; a failed count read retries a bounded
//! number of times and then surfaces.

use crate::{
    cache::SnapshotCache,
    config::{EngineConfig, InactiveHabits},
    error::EngineError,
    gateway::EntityReader,
    streak, SessionContext,
};
use chainflow_primitives::{Habit, Task};
use chainflow_registry::{AbiVariant, EntityKind};
use std::{future::Future, sync::Arc, time::Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Cache-aware entity synchronizer.
#[derive(Debug)]
pub struct EntitySync {
    cache: Arc<SnapshotCache>,
    config: EngineConfig,
}

impl EntitySync {
    /// Creates a synchronizer writing through `cache`.
    pub fn new(cache: Arc<SnapshotCache>, config: EngineConfig) -> Self {
        Self { cache, config }
    }

    /// Returns the account's habit list, from cache when a fresh snapshot
    /// exists and `force` is off.
    pub async fn habits(
        &self,
        reader: &dyn EntityReader,
        ctx: &SessionContext,
        force: bool,
    ) -> Result<Vec<Habit>, EngineError> {
        let chain_id = reader.profile().chain_id;
        if !force {
            if let Some(cached) =
                self.cache.load::<Habit>(EntityKind::Habits, ctx.account, chain_id)
            {
                debug!(target: "chainflow::sync", account = %ctx.account, count = cached.len(), "serving habits from cache");
                return Ok(cached);
            }
        }

        let start = Instant::now();
        let habits = self.load_habits(reader, ctx).await?;
        self.cache.save(EntityKind::Habits, ctx.account, chain_id, &habits);
        debug!(
            target: "chainflow::sync",
            account = %ctx.account,
            count = habits.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "habit list synced"
        );
        Ok(habits)
    }

    /// Forced habit refresh that expects the list to be non-empty, as
    /// after a creation confirmed. Retries while the endpoint still serves
    /// the pre-transaction state, then accepts whatever it saw last.
    pub async fn habits_expecting_growth(
        &self,
        reader: &dyn EntityReader,
        ctx: &SessionContext,
    ) -> Result<Vec<Habit>, EngineError> {
        for attempt in 1..=self.config.creation_refresh_attempts {
            let habits = self.habits(reader, ctx, true).await?;
            if !habits.is_empty() {
                return Ok(habits);
            }
            debug!(target: "chainflow::sync", attempt, "habit list still empty after creation, retrying");
            if attempt < self.config.creation_refresh_attempts {
                sleep(self.config.creation_refresh_delay).await;
            }
        }
        Ok(Vec::new())
    }

    /// Returns the account's task list for the reader's chain.
    pub async fn tasks(
        &self,
        reader: &dyn EntityReader,
        ctx: &SessionContext,
        force: bool,
    ) -> Result<Vec<Task>, EngineError> {
        let chain_id = reader.profile().chain_id;
        if !force {
            if let Some(cached) = self.cache.load::<Task>(EntityKind::Tasks, ctx.account, chain_id)
            {
                debug!(target: "chainflow::sync", account = %ctx.account, count = cached.len(), "serving tasks from cache");
                return Ok(cached);
            }
        }

        let start = Instant::now();
        let tasks = self.load_tasks(reader, ctx).await?;
        self.cache.save(EntityKind::Tasks, ctx.account, chain_id, &tasks);
        debug!(
            target: "chainflow::sync",
            account = %ctx.account,
            chain_id,
            count = tasks.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "task list synced"
        );
        Ok(tasks)
    }

    /// Forced task refresh after a creation confirmed.
    pub async fn tasks_expecting_growth(
        &self,
        reader: &dyn EntityReader,
        ctx: &SessionContext,
    ) -> Result<Vec<Task>, EngineError> {
        for attempt in 1..=self.config.creation_refresh_attempts {
            let tasks = self.tasks(reader, ctx, true).await?;
            if !tasks.is_empty() {
                return Ok(tasks);
            }
            debug!(target: "chainflow::sync", attempt, "task list still empty after creation, retrying");
            if attempt < self.config.creation_refresh_attempts {
                sleep(self.config.creation_refresh_delay).await;
            }
        }
        Ok(Vec::new())
    }

    async fn load_habits(
        &self,
        reader: &dyn EntityReader,
        ctx: &SessionContext,
    ) -> Result<Vec<Habit>, EngineError> {
        let mut habits = match reader.profile().abi {
            AbiVariant::Batched => {
                self.with_read_retry("habit range", || reader.user_habits(ctx.account)).await?
            }
            AbiVariant::PerIndex => {
                let count =
                    self.with_read_retry("habit count", || reader.habit_count()).await?;
                let mut habits = Vec::new();
                for habit_id in 0..count {
                    match reader.habit(habit_id).await {
                        Ok(habit) => {
                            if habit.is_relevant_to(ctx.account) {
                                habits.push(habit);
                            }
                        }
                        Err(err) => {
                            warn!(target: "chainflow::sync", habit_id, %err, "skipping unreadable habit");
                        }
                    }
                }
                habits
            }
        };

        if self.config.inactive_habits == InactiveHabits::Hide {
            habits.retain(|habit| habit.active);
        }

        for habit in &mut habits {
            let summary =
                streak::compute_streak(reader, habit.id, self.config.streak_horizon_days).await;
            habit.streak = summary.streak;
            habit.total_checkins = summary.total_checkins;
            habit.last_checked_in_day = summary.last_checked_in_day;
        }

        Ok(habits)
    }

    async fn load_tasks(
        &self,
        reader: &dyn EntityReader,
        ctx: &SessionContext,
    ) -> Result<Vec<Task>, EngineError> {
        match reader.profile().abi {
            AbiVariant::Batched => {
                self.with_read_retry("task range", || reader.user_tasks(ctx.account)).await
            }
            AbiVariant::PerIndex => {
                let count = self.with_read_retry("task count", || reader.task_count()).await?;
                let mut tasks = Vec::new();
                for task_id in 0..count {
                    match reader.task(task_id).await {
                        Ok(task) => {
                            if task.is_relevant_to(ctx.account) {
                                tasks.push(task);
                            }
                        }
                        Err(err) => {
                            warn!(target: "chainflow::sync", task_id, %err, "skipping unreadable task");
                        }
                    }
                }
                Ok(tasks)
            }
        }
    }

    /// Runs a whole-list read with fixed-delay retries. Individual entity
    /// reads are never retried, only the reads the rest of a refresh
    /// depends on.
    async fn with_read_retry<T, F, Fut>(
        &self,
        what: &'static str,
        mut op: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut last_error = None;
        for attempt in 0..=self.config.read_retry_attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(target: "chainflow::sync", what, attempt = attempt + 1, "read succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    warn!(target: "chainflow::sync", what, attempt = attempt + 1, %err, "read failed");
                    last_error = Some(err);
                    if attempt < self.config.read_retry_attempts {
                        sleep(self.config.read_retry_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            EngineError::Unknown(format!("{what} read failed with no attempts made"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::SessionStore, mock::MockLedger};
    use alloy_primitives::{address, Address};
    use chainflow_primitives::{current_day_index, TaskStatus};
    use chainflow_registry::{resolve, BASE_MAINNET, SOMNIA_TESTNET};
    use std::time::Duration;

    const ACCOUNT: Address = address!("00000000000000000000000000000000000000aa");
    const OTHER: Address = address!("00000000000000000000000000000000000000bb");

    fn fast_config() -> EngineConfig {
        EngineConfig {
            read_retry_delay: Duration::from_millis(1),
            creation_refresh_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn syncer(config: EngineConfig) -> EntitySync {
        let cache =
            Arc::new(SnapshotCache::new(Arc::new(SessionStore::default()), config.cache_ttl));
        EntitySync::new(cache, config)
    }

    fn ctx() -> SessionContext {
        SessionContext::new(ACCOUNT, SOMNIA_TESTNET)
    }

    #[tokio::test]
    async fn only_the_accounts_habits_survive() {
        let ledger = MockLedger::new();
        ledger.push_habit("mine", "", "fitness", ACCOUNT);
        ledger.push_habit("theirs", "", "fitness", OTHER);
        ledger.push_habit("also mine", "", "learning", ACCOUNT);

        let habits = syncer(fast_config()).habits(&ledger, &ctx(), false).await.unwrap();
        assert_eq!(habits.len(), 2);
        assert!(habits.iter().all(|h| h.creator == ACCOUNT));
    }

    #[tokio::test]
    async fn unreadable_entities_are_skipped_not_fatal() {
        let ledger = MockLedger::new();
        ledger.push_habit("a", "", "fitness", ACCOUNT);
        ledger.push_habit("b", "", "fitness", ACCOUNT);
        ledger.push_habit("c", "", "fitness", ACCOUNT);
        ledger.fail_habit_index(1);

        let habits = syncer(fast_config()).habits(&ledger, &ctx(), false).await.unwrap();
        assert_eq!(habits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[tokio::test]
    async fn count_reads_retry_then_recover() {
        let ledger = MockLedger::new();
        ledger.push_habit("a", "", "fitness", ACCOUNT);
        ledger.fail_next_habit_counts(1);

        let habits = syncer(fast_config()).habits(&ledger, &ctx(), false).await.unwrap();
        assert_eq!(habits.len(), 1);
        assert_eq!(ledger.reads().habit_count, 2);
    }

    #[tokio::test]
    async fn count_reads_exhaust_into_an_error() {
        let ledger = MockLedger::new();
        ledger.fail_next_habit_counts(10);

        let err = syncer(fast_config()).habits(&ledger, &ctx(), false).await.unwrap_err();
        assert!(matches!(err, EngineError::Ledger(_)));
        // Initial read plus the configured retries.
        assert_eq!(ledger.reads().habit_count, 3);
    }

    #[tokio::test]
    async fn a_fresh_snapshot_costs_zero_reads() {
        let ledger = MockLedger::new();
        ledger.push_habit("a", "", "fitness", ACCOUNT);
        let sync = syncer(fast_config());

        sync.habits(&ledger, &ctx(), false).await.unwrap();
        let after_first = ledger.reads().total();

        let again = sync.habits(&ledger, &ctx(), false).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(ledger.reads().total(), after_first);
    }

    #[tokio::test]
    async fn force_bypasses_the_cache() {
        let ledger = MockLedger::new();
        ledger.push_habit("a", "", "fitness", ACCOUNT);
        let sync = syncer(fast_config());

        sync.habits(&ledger, &ctx(), false).await.unwrap();
        let after_first = ledger.reads().total();

        sync.habits(&ledger, &ctx(), true).await.unwrap();
        assert!(ledger.reads().total() > after_first);
    }

    #[tokio::test]
    async fn streaks_are_derived_during_sync() {
        let ledger = MockLedger::new();
        let id = ledger.push_habit("run", "", "fitness", ACCOUNT);
        let today = current_day_index();
        ledger.set_checked_in(id, today);
        ledger.set_checked_in(id, today - 1);

        let habits = syncer(fast_config()).habits(&ledger, &ctx(), false).await.unwrap();
        assert_eq!(habits[0].streak, 2);
        assert_eq!(habits[0].total_checkins, 2);
        assert_eq!(habits[0].last_checked_in_day, Some(today));
    }

    #[tokio::test]
    async fn batched_deployments_use_one_range_read() {
        let ledger = MockLedger::with_profile(resolve(BASE_MAINNET));
        ledger.push_habit("a", "", "fitness", ACCOUNT);
        ledger.push_habit("b", "", "fitness", ACCOUNT);

        let ctx = SessionContext::new(ACCOUNT, BASE_MAINNET);
        let habits = syncer(fast_config()).habits(&ledger, &ctx, false).await.unwrap();
        assert_eq!(habits.len(), 2);
        assert_eq!(ledger.reads().habit_ranges, 1);
        assert_eq!(ledger.reads().habit_count, 0);
        assert_eq!(ledger.reads().habits, 0);
    }

    #[tokio::test]
    async fn hide_policy_drops_inactive_habits() {
        let ledger = MockLedger::new();
        ledger.push_habit("live", "", "fitness", ACCOUNT);
        let retired = ledger.push_habit("retired", "", "fitness", ACCOUNT);
        ledger.set_habit_active(retired, false);

        let config = EngineConfig { inactive_habits: InactiveHabits::Hide, ..fast_config() };
        let habits = syncer(config).habits(&ledger, &ctx(), false).await.unwrap();
        assert_eq!(habits.len(), 1);
        assert_eq!(habits[0].name, "live");

        let keep = syncer(fast_config()).habits(&ledger, &ctx(), false).await.unwrap();
        assert_eq!(keep.len(), 2);
    }

    #[tokio::test]
    async fn creation_refresh_retries_until_the_entity_appears() {
        let ledger = MockLedger::new();
        ledger.push_habit("new", "", "fitness", ACCOUNT);
        ledger.stale_habit_counts(2);

        let habits =
            syncer(fast_config()).habits_expecting_growth(&ledger, &ctx()).await.unwrap();
        assert_eq!(habits.len(), 1);
        assert_eq!(ledger.reads().habit_count, 3);
    }

    #[tokio::test]
    async fn creation_refresh_accepts_a_persistently_empty_list() {
        let ledger = MockLedger::new();
        let habits =
            syncer(fast_config()).habits_expecting_growth(&ledger, &ctx()).await.unwrap();
        assert!(habits.is_empty());
        assert_eq!(ledger.reads().habit_count, 3);
    }

    #[tokio::test]
    async fn tasks_include_assigned_and_created() {
        let ledger = MockLedger::new();
        ledger.push_task("created by me", "1", ACCOUNT, OTHER);
        ledger.push_task("assigned to me", "2", OTHER, ACCOUNT);
        ledger.push_task("unrelated", "3", OTHER, OTHER);
        ledger.set_task_status(1, TaskStatus::DoneByAssignee);

        let tasks = syncer(fast_config()).tasks(&ledger, &ctx(), false).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].status, TaskStatus::DoneByAssignee);
    }
}
