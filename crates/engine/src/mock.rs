//! Scripted ledger doubles for tests.
//!
//! [`MockCall`] answers raw contract calls from a response table, which
//! exercises the real codec through the gateway. [`MockLedger`] sits one
//! level higher: it implements both [`EntityReader`] and [`LedgerWriter`]
//! over in-memory entity state, counts every call, and can be scripted to
//! fail in the ways a real endpoint does.

#![allow(missing_docs)]

use crate::{
    client::{LedgerCall, ReceiptInfo},
    executor::LedgerWriter,
    gateway::EntityReader,
};
use alloy_primitives::{Address, Bytes, TxHash, B256, U256};
use alloy_rpc_types::TransactionRequest;
use alloy_sol_types::SolValue;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chainflow_primitives::{Habit, HabitCategory, Task, TaskStatus};
use chainflow_registry::{resolve, ChainProfile, SOMNIA_TESTNET};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

/// Raw call double keyed on contract address and calldata.
#[derive(Debug, Default)]
pub struct MockCall {
    responses: Mutex<HashMap<(Address, Bytes), Bytes>>,
}

impl MockCall {
    /// Scripts a raw response for a call.
    pub fn set_response(&self, to: Address, input: Bytes, response: Bytes) {
        self.responses.lock().insert((to, input), response);
    }

    /// Scripts a response by ABI-encoding a Solidity value, the shape a
    /// contract's return data actually has.
    pub fn set_sol_response<R: SolValue>(&self, to: Address, input: Bytes, response: R) {
        self.set_response(to, input, Bytes::from(response.abi_encode()));
    }
}

#[async_trait]
impl LedgerCall for MockCall {
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        self.responses
            .lock()
            .get(&(to, input))
            .cloned()
            .ok_or_else(|| anyhow!("unscripted call to {to}"))
    }
}

/// Read call counts at a point in time.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadCounts {
    pub habit_count: u64,
    pub habits: u64,
    pub checkins: u64,
    pub task_count: u64,
    pub tasks: u64,
    pub habit_ranges: u64,
    pub task_ranges: u64,
}

impl ReadCounts {
    pub fn total(&self) -> u64 {
        self.habit_count +
            self.habits +
            self.checkins +
            self.task_count +
            self.tasks +
            self.habit_ranges +
            self.task_ranges
    }
}

/// Write call counts at a point in time.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteCounts {
    pub nonces: u64,
    pub estimates: u64,
    pub gas_prices: u64,
    pub submits: u64,
    pub receipts: u64,
}

impl WriteCounts {
    pub fn total(&self) -> u64 {
        self.nonces + self.estimates + self.gas_prices + self.submits + self.receipts
    }
}

#[derive(Debug, Default)]
struct ReadCounters {
    habit_count: AtomicU64,
    habits: AtomicU64,
    checkins: AtomicU64,
    task_count: AtomicU64,
    tasks: AtomicU64,
    habit_ranges: AtomicU64,
    task_ranges: AtomicU64,
}

#[derive(Debug, Default)]
struct WriteCounters {
    nonces: AtomicU64,
    estimates: AtomicU64,
    gas_prices: AtomicU64,
    submits: AtomicU64,
    receipts: AtomicU64,
}

fn consume(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1)).is_ok()
}

/// In-memory ledger scripted per test.
#[derive(Debug)]
pub struct MockLedger {
    profile: ChainProfile,
    habits: Mutex<Vec<Habit>>,
    tasks: Mutex<Vec<Task>>,
    checkins: Mutex<HashSet<(u64, u64)>>,
    failing_habits: Mutex<HashSet<u64>>,
    failing_tasks: Mutex<HashSet<u64>>,
    failing_checkins: Mutex<HashSet<(u64, u64)>>,
    habit_count_errors: AtomicU32,
    task_count_errors: AtomicU32,
    stale_habit_counts: AtomicU32,
    reads: ReadCounters,
    writes: WriteCounters,
    nonce: AtomicU64,
    gas_estimate: AtomicU64,
    gas_price: AtomicU64,
    submit_error: Mutex<Option<String>>,
    estimate_error: Mutex<Option<String>>,
    receipt_read_errors: AtomicU32,
    auto_confirm: Mutex<bool>,
    submitted: Mutex<Vec<TransactionRequest>>,
    receipts: Mutex<HashMap<TxHash, ReceiptInfo>>,
    next_hash: AtomicU64,
    last_hash: Mutex<Option<TxHash>>,
}

impl MockLedger {
    /// Ledger on the default habit deployment.
    pub fn new() -> Self {
        Self::for_chain(SOMNIA_TESTNET)
    }

    /// Ledger presenting as the given chain, including unsupported ones.
    pub fn for_chain(chain_id: u64) -> Self {
        Self::with_profile(resolve(chain_id))
    }

    pub fn with_profile(profile: ChainProfile) -> Self {
        Self {
            profile,
            habits: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            checkins: Mutex::new(HashSet::new()),
            failing_habits: Mutex::new(HashSet::new()),
            failing_tasks: Mutex::new(HashSet::new()),
            failing_checkins: Mutex::new(HashSet::new()),
            habit_count_errors: AtomicU32::new(0),
            task_count_errors: AtomicU32::new(0),
            stale_habit_counts: AtomicU32::new(0),
            reads: ReadCounters::default(),
            writes: WriteCounters::default(),
            nonce: AtomicU64::new(0),
            gas_estimate: AtomicU64::new(100_000),
            gas_price: AtomicU64::new(1_000_000_000),
            submit_error: Mutex::new(None),
            estimate_error: Mutex::new(None),
            receipt_read_errors: AtomicU32::new(0),
            auto_confirm: Mutex::new(true),
            submitted: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            next_hash: AtomicU64::new(0),
            last_hash: Mutex::new(None),
        }
    }

    // Entity state.

    pub fn push_habit(
        &self,
        name: &str,
        description: &str,
        category: &str,
        creator: Address,
    ) -> u64 {
        let mut habits = self.habits.lock();
        let id = habits.len() as u64;
        habits.push(Habit {
            id,
            name: name.to_owned(),
            description: description.to_owned(),
            category: HabitCategory::from(category),
            creator,
            streak: 0,
            last_checked_in_day: None,
            total_checkins: 0,
            active: true,
        });
        id
    }

    pub fn push_task(
        &self,
        title: &str,
        reward: &str,
        creator: Address,
        assignee: Address,
    ) -> u64 {
        let mut tasks = self.tasks.lock();
        let id = tasks.len() as u64;
        tasks.push(Task {
            id,
            title: title.to_owned(),
            description: String::new(),
            reward: reward.to_owned(),
            creator,
            assignee,
            status: TaskStatus::Assigned,
        });
        id
    }

    pub fn set_task_status(&self, task_id: u64, status: TaskStatus) {
        if let Some(task) = self.tasks.lock().get_mut(task_id as usize) {
            task.status = status;
        }
    }

    pub fn set_habit_active(&self, habit_id: u64, active: bool) {
        if let Some(habit) = self.habits.lock().get_mut(habit_id as usize) {
            habit.active = active;
        }
    }

    pub fn set_checked_in(&self, habit_id: u64, day_index: u64) {
        self.checkins.lock().insert((habit_id, day_index));
    }

    // Failure scripting.

    pub fn fail_habit_index(&self, habit_id: u64) {
        self.failing_habits.lock().insert(habit_id);
    }

    pub fn fail_task_index(&self, task_id: u64) {
        self.failing_tasks.lock().insert(task_id);
    }

    pub fn fail_checkin_read(&self, habit_id: u64, day_index: u64) {
        self.failing_checkins.lock().insert((habit_id, day_index));
    }

    /// The next `n` habit count reads error out.
    pub fn fail_next_habit_counts(&self, n: u32) {
        self.habit_count_errors.store(n, Ordering::SeqCst);
    }

    /// The next `n` task count reads error out.
    pub fn fail_next_task_counts(&self, n: u32) {
        self.task_count_errors.store(n, Ordering::SeqCst);
    }

    /// The next `n` habit count reads report zero, the way an endpoint
    /// lags right after a creation confirms.
    pub fn stale_habit_counts(&self, n: u32) {
        self.stale_habit_counts.store(n, Ordering::SeqCst);
    }

    pub fn script_submit_error(&self, message: &str) {
        *self.submit_error.lock() = Some(message.to_owned());
    }

    pub fn script_estimate_error(&self, message: &str) {
        *self.estimate_error.lock() = Some(message.to_owned());
    }

    pub fn fail_next_receipt_reads(&self, n: u32) {
        self.receipt_read_errors.store(n, Ordering::SeqCst);
    }

    // Write-side scripting.

    pub fn set_next_nonce(&self, nonce: u64) {
        self.nonce.store(nonce, Ordering::SeqCst);
    }

    pub fn set_gas_estimate(&self, estimate: u64) {
        self.gas_estimate.store(estimate, Ordering::SeqCst);
    }

    /// When off, submitted transactions stay pending until a receipt is
    /// scripted explicitly. On by default.
    pub fn set_auto_confirm(&self, on: bool) {
        *self.auto_confirm.lock() = on;
    }

    pub fn script_receipt(&self, hash: TxHash, info: ReceiptInfo) {
        self.receipts.lock().insert(hash, info);
    }

    pub fn script_failed_receipt(&self, hash: TxHash) {
        self.script_receipt(hash, ReceiptInfo { succeeded: false, block_number: Some(1) });
    }

    // Introspection.

    pub fn reads(&self) -> ReadCounts {
        ReadCounts {
            habit_count: self.reads.habit_count.load(Ordering::SeqCst),
            habits: self.reads.habits.load(Ordering::SeqCst),
            checkins: self.reads.checkins.load(Ordering::SeqCst),
            task_count: self.reads.task_count.load(Ordering::SeqCst),
            tasks: self.reads.tasks.load(Ordering::SeqCst),
            habit_ranges: self.reads.habit_ranges.load(Ordering::SeqCst),
            task_ranges: self.reads.task_ranges.load(Ordering::SeqCst),
        }
    }

    pub fn writes(&self) -> WriteCounts {
        WriteCounts {
            nonces: self.writes.nonces.load(Ordering::SeqCst),
            estimates: self.writes.estimates.load(Ordering::SeqCst),
            gas_prices: self.writes.gas_prices.load(Ordering::SeqCst),
            submits: self.writes.submits.load(Ordering::SeqCst),
            receipts: self.writes.receipts.load(Ordering::SeqCst),
        }
    }

    pub fn submitted(&self) -> Vec<TransactionRequest> {
        self.submitted.lock().clone()
    }

    pub fn last_hash(&self) -> Option<TxHash> {
        *self.last_hash.lock()
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityReader for MockLedger {
    fn profile(&self) -> &ChainProfile {
        &self.profile
    }

    async fn habit_count(&self) -> Result<u64, crate::EngineError> {
        self.reads.habit_count.fetch_add(1, Ordering::SeqCst);
        if consume(&self.habit_count_errors) {
            return Err(crate::EngineError::Ledger(anyhow!("habit count read failed")));
        }
        if consume(&self.stale_habit_counts) {
            return Ok(0);
        }
        Ok(self.habits.lock().len() as u64)
    }

    async fn habit(&self, habit_id: u64) -> Result<Habit, crate::EngineError> {
        self.reads.habits.fetch_add(1, Ordering::SeqCst);
        if self.failing_habits.lock().contains(&habit_id) {
            return Err(crate::EngineError::Ledger(anyhow!("habit {habit_id} read failed")));
        }
        self.habits
            .lock()
            .get(habit_id as usize)
            .cloned()
            .ok_or_else(|| crate::EngineError::Ledger(anyhow!("habit {habit_id} out of range")))
    }

    async fn is_checked_in(
        &self,
        habit_id: u64,
        day_index: u64,
    ) -> Result<bool, crate::EngineError> {
        self.reads.checkins.fetch_add(1, Ordering::SeqCst);
        if self.failing_checkins.lock().contains(&(habit_id, day_index)) {
            return Err(crate::EngineError::Ledger(anyhow!("check-in read failed")));
        }
        Ok(self.checkins.lock().contains(&(habit_id, day_index)))
    }

    async fn task_count(&self) -> Result<u64, crate::EngineError> {
        self.reads.task_count.fetch_add(1, Ordering::SeqCst);
        if consume(&self.task_count_errors) {
            return Err(crate::EngineError::Ledger(anyhow!("task count read failed")));
        }
        Ok(self.tasks.lock().len() as u64)
    }

    async fn task(&self, task_id: u64) -> Result<Task, crate::EngineError> {
        self.reads.tasks.fetch_add(1, Ordering::SeqCst);
        if self.failing_tasks.lock().contains(&task_id) {
            return Err(crate::EngineError::Ledger(anyhow!("task {task_id} read failed")));
        }
        self.tasks
            .lock()
            .get(task_id as usize)
            .cloned()
            .ok_or_else(|| crate::EngineError::Ledger(anyhow!("task {task_id} out of range")))
    }

    async fn user_habits(&self, account: Address) -> Result<Vec<Habit>, crate::EngineError> {
        self.reads.habit_ranges.fetch_add(1, Ordering::SeqCst);
        Ok(self.habits.lock().iter().filter(|h| h.creator == account).cloned().collect())
    }

    async fn user_tasks(&self, account: Address) -> Result<Vec<Task>, crate::EngineError> {
        self.reads.task_ranges.fetch_add(1, Ordering::SeqCst);
        Ok(self.tasks.lock().iter().filter(|t| t.is_relevant_to(account)).cloned().collect())
    }
}

#[async_trait]
impl LedgerWriter for MockLedger {
    async fn pending_nonce(&self, _account: Address) -> Result<u64> {
        self.writes.nonces.fetch_add(1, Ordering::SeqCst);
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn estimate_gas(&self, _tx: &TransactionRequest) -> Result<u64> {
        self.writes.estimates.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.estimate_error.lock().take() {
            return Err(anyhow!(message));
        }
        Ok(self.gas_estimate.load(Ordering::SeqCst))
    }

    async fn gas_price(&self) -> Result<u128> {
        self.writes.gas_prices.fetch_add(1, Ordering::SeqCst);
        Ok(u128::from(self.gas_price.load(Ordering::SeqCst)))
    }

    async fn submit(&self, tx: TransactionRequest) -> Result<TxHash> {
        self.writes.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.submit_error.lock().take() {
            return Err(anyhow!(message));
        }

        let seq = self.next_hash.fetch_add(1, Ordering::SeqCst) + 1;
        let hash = B256::from(U256::from(seq));
        self.submitted.lock().push(tx);
        self.nonce.fetch_add(1, Ordering::SeqCst);
        *self.last_hash.lock() = Some(hash);
        if *self.auto_confirm.lock() {
            self.receipts
                .lock()
                .insert(hash, ReceiptInfo { succeeded: true, block_number: Some(1) });
        }
        Ok(hash)
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<ReceiptInfo>> {
        self.writes.receipts.fetch_add(1, Ordering::SeqCst);
        if consume(&self.receipt_read_errors) {
            return Err(anyhow!("receipt read failed"));
        }
        Ok(self.receipts.lock().get(&hash).copied())
    }
}
