//! Per-account transaction log.
//!
//! Every accepted write is recorded as `Submitted` and later settled to
//! `Confirmed`, `Failed` or `TimedOut` by the confirmation watcher. The log
//! lives in the session store under its own key prefix, newest first,
//! capped per account. It is an operation record, not a cache: refreshes
//! and invalidation sweeps never touch it.

use crate::cache::{cache_key, SessionStore, HISTORY_PREFIX};
use alloy_primitives::{Address, TxHash};
use chainflow_primitives::now_ms;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Settlement state of a logged transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// Accepted by an endpoint, receipt not yet observed.
    Submitted,
    /// Receipt observed with success status.
    Confirmed,
    /// Receipt observed with failure status, or the send itself failed
    /// after acceptance.
    Failed,
    /// No receipt within the deadline; the true outcome is unknown.
    TimedOut,
}

/// One logged transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Transaction hash.
    pub tx_hash: TxHash,
    /// Contract function that was called.
    pub function: String,
    /// Human-readable description of the action.
    pub description: String,
    /// Chain the transaction was sent to.
    pub chain_id: u64,
    /// Submission time in unix milliseconds.
    pub submitted_at_ms: u64,
    /// Current settlement state.
    pub status: HistoryStatus,
}

/// Capped per-account transaction log over the session store.
#[derive(Debug)]
pub struct TxHistory {
    store: Arc<SessionStore>,
    cap: usize,
}

impl TxHistory {
    /// Creates a log keeping at most `cap` entries per account.
    pub fn new(store: Arc<SessionStore>, cap: usize) -> Self {
        Self { store, cap }
    }

    fn key(account: Address) -> String {
        cache_key(HISTORY_PREFIX, account, None)
    }

    fn read(&self, account: Address) -> Vec<HistoryEntry> {
        let key = Self::key(account);
        let Some(raw) = self.store.get(&key) else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(target: "chainflow::history", %account, %err, "discarding malformed transaction log");
                self.store.remove(&key);
                Vec::new()
            }
        }
    }

    fn write(&self, account: Address, entries: &[HistoryEntry]) {
        match serde_json::to_string(entries) {
            Ok(raw) => self.store.set(&Self::key(account), raw),
            Err(err) => {
                warn!(target: "chainflow::history", %account, %err, "failed to serialize transaction log");
            }
        }
    }

    /// Records a newly accepted transaction as `Submitted`.
    pub fn record_submitted(
        &self,
        account: Address,
        tx_hash: TxHash,
        function: &str,
        description: &str,
        chain_id: u64,
    ) {
        let mut entries = self.read(account);
        entries.insert(0, HistoryEntry {
            tx_hash,
            function: function.to_owned(),
            description: description.to_owned(),
            chain_id,
            submitted_at_ms: now_ms(),
            status: HistoryStatus::Submitted,
        });
        entries.truncate(self.cap);
        self.write(account, &entries);
        debug!(target: "chainflow::history", %account, %tx_hash, function, "transaction recorded");
    }

    /// Settles a logged transaction to its final status. Unknown hashes
    /// are ignored; the entry may have aged out of the cap.
    pub fn mark(&self, account: Address, tx_hash: TxHash, status: HistoryStatus) {
        let mut entries = self.read(account);
        let mut touched = false;
        for entry in &mut entries {
            if entry.tx_hash == tx_hash {
                entry.status = status;
                touched = true;
                break;
            }
        }
        if touched {
            self.write(account, &entries);
        }
    }

    /// The account's log, newest first.
    pub fn entries(&self, account: Address) -> Vec<HistoryEntry> {
        self.read(account)
    }

    /// Drops the account's log, as on disconnect.
    pub fn clear(&self, account: Address) {
        self.store.remove(&Self::key(account));
    }
}
