//! Transactional state synchronization between a wallet session and
//! contract ledgers.
//!
//! The ledger is the source of truth; this crate keeps a client's view of
//! it coherent. Reads go through a snapshot cache with a short TTL. Writes
//! are sequenced explicitly (nonce, gas estimate with headroom, gas price)
//! and guarded so each operation category has at most one transaction in
//! flight. A confirmation watcher tracks every broadcast to a terminal
//! outcome and reconciles the cache and the transaction log with it, and
//! an event poller invalidates cached state that other sessions changed.
//!
//! [`SyncEngine`] is the front door. The seams underneath it, [`LedgerCall`]
//! for raw reads, [`EntityReader`] for typed reads, and [`LedgerWriter`]
//! for sequenced writes, are traits so every flow above the transport can
//! run against a scripted ledger.

use alloy_primitives::Address;

pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod history;
pub mod invalidator;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod streak;
pub mod sync;
pub mod watcher;

pub use cache::{cache_key, CachedSnapshot, SessionStore, SnapshotCache};
pub use client::{LedgerCall, LedgerClient, ProviderMetrics, ReceiptInfo, RetryConfig};
pub use config::{EngineConfig, InactiveHabits};
pub use engine::{BackgroundHandle, SyncEngine};
pub use error::EngineError;
pub use executor::{LedgerWriter, OpCategory, PendingOperation, SigningClient, TxExecutor};
pub use gateway::{EntityGateway, EntityReader};
pub use history::{HistoryEntry, HistoryStatus, TxHistory};
pub use invalidator::{invalidation_for_log, EventInvalidator, Invalidation, RefreshWorker};
pub use streak::{compute_streak, fold_checkin_days, streak_from_logs, StreakSummary};
pub use sync::EntitySync;
pub use watcher::{ConfirmationWatcher, TxOutcome};

pub use chainflow_primitives::{Habit, HabitCategory, HabitStats, Task, TaskStats, TaskStatus};
pub use chainflow_registry::{Action, ChainProfile, EntityKind};

/// The account and chain a session operates as.
///
/// Habit traffic ignores `chain_id` and routes to the habit chain; task
/// traffic follows it. Writes additionally require the wallet to actually
/// be on the chain the action needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    /// Wallet address the session reads and writes for.
    pub account: Address,
    /// Chain the wallet currently reports.
    pub chain_id: u64,
}

impl SessionContext {
    /// Binds an account to the chain its wallet reports.
    pub const fn new(account: Address, chain_id: u64) -> Self {
        Self { account, chain_id }
    }
}
