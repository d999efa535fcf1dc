//! Session-scoped snapshot cache for synced entity lists.
//!
//! Entity lists are cached as JSON strings under prefixed keys, one entry
//! per account (and per chain for tasks). Entries expire by timestamp, and
//! any malformed or stale entry degrades to a miss. The backing
//! [`SessionStore`] can be snapshotted to disk and restored, which keeps
//! warm caches across process restarts.

use alloy_primitives::Address;
use anyhow::{Context as AnyhowContext, Result};
use chainflow_primitives::now_ms;
use chainflow_registry::EntityKind;
use dashmap::DashMap;
use metrics::Gauge;
use metrics_derive::Metrics;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Key prefix for cached habit lists.
pub const HABITS_PREFIX: &str = "chainflow_habits_";
/// Key prefix for cached task lists.
pub const TASKS_PREFIX: &str = "chainflow_tasks_";
/// Key prefix for the per-account transaction log.
pub const HISTORY_PREFIX: &str = "chainflow_txlog_";

const SNAPSHOT_VERSION: u32 = 1;

/// Builds the storage key for an account-scoped entry.
pub fn cache_key(prefix: &str, account: Address, chain_id: Option<u64>) -> String {
    let account = account.to_string().to_lowercase();
    match chain_id {
        Some(id) => format!("{prefix}{account}_{id}"),
        None => format!("{prefix}{account}"),
    }
}

/// Key layout per entity kind. Habits live on a single deployment so their
/// key carries no chain suffix; tasks are cached per chain.
pub(crate) fn key_parts(kind: EntityKind, chain_id: u64) -> (&'static str, Option<u64>) {
    match kind {
        EntityKind::Habits => (HABITS_PREFIX, None),
        EntityKind::Tasks => (TASKS_PREFIX, Some(chain_id)),
    }
}

/// String key-value store backing the cache and the transaction log.
#[derive(Debug, Default)]
pub struct SessionStore {
    entries: DashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    version: u32,
    entries: HashMap<String, String>,
}

impl SessionStore {
    /// Reads a raw entry.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Writes a raw entry.
    pub fn set(&self, key: &str, value: String) {
        self.entries.insert(key.to_owned(), value);
    }

    /// Drops one entry.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops every entry whose key starts with `prefix`.
    pub fn remove_prefixed(&self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the whole store to `path` as one JSON document. The write
    /// goes through a sibling temp file and a rename so a crash cannot
    /// leave a half-written snapshot behind.
    pub fn snapshot_to(&self, path: &Path) -> Result<()> {
        let entries: HashMap<String, String> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let snapshot = StoreSnapshot { version: SNAPSHOT_VERSION, entries };

        let tmp = path.with_extension("tmp");
        let file = File::create(&tmp)
            .with_context(|| format!("Failed to create snapshot file: {}", tmp.display()))?;
        serde_json::to_writer(BufWriter::new(file), &snapshot)
            .with_context(|| "Failed to serialize store snapshot")?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;

        debug!(target: "chainflow::cache", path = %path.display(), entries = snapshot.entries.len(), "store snapshot written");
        Ok(())
    }

    /// Loads entries from a snapshot written by [`Self::snapshot_to`].
    /// Returns `false` when the file is absent or carries an unknown
    /// version; existing entries are kept either way.
    pub fn restore_from(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let file = File::open(path)
            .with_context(|| format!("Failed to open snapshot file: {}", path.display()))?;
        let snapshot: StoreSnapshot = serde_json::from_reader(BufReader::new(file))
            .with_context(|| "Failed to parse store snapshot")?;

        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                target: "chainflow::cache",
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "ignoring store snapshot with unknown version"
            );
            return Ok(false);
        }

        let count = snapshot.entries.len();
        for (key, value) in snapshot.entries {
            self.entries.insert(key, value);
        }
        debug!(target: "chainflow::cache", entries = count, "store snapshot restored");
        Ok(true)
    }
}

/// A cached entity list with its write timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSnapshot<T> {
    /// The cached entities.
    pub data: Vec<T>,
    /// Write time in unix milliseconds.
    pub timestamp: u64,
}

#[derive(Serialize)]
struct SnapshotRef<'a, T> {
    data: &'a [T],
    timestamp: u64,
}

#[derive(Metrics)]
#[metrics(scope = "sync")]
struct CacheMetrics {
    /// Snapshot cache hit ratio
    cache_hit_ratio: Gauge,
    /// Number of entries in the session store
    cache_num_entries: Gauge,
}

#[derive(Default)]
struct HitRecorder {
    not_hit_cnt: AtomicU64,
    hit_cnt: AtomicU64,
}

impl HitRecorder {
    fn not_hit(&self) {
        self.not_hit_cnt.fetch_add(1, Ordering::Relaxed);
    }

    fn hit(&self) {
        self.hit_cnt.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> Option<f64> {
        let not_hit_cnt = self.not_hit_cnt.swap(0, Ordering::Relaxed);
        let hit_cnt = self.hit_cnt.swap(0, Ordering::Relaxed);
        let visit_cnt = not_hit_cnt + hit_cnt;
        (visit_cnt > 0).then(|| hit_cnt as f64 / visit_cnt as f64)
    }
}

/// TTL cache over a [`SessionStore`].
pub struct SnapshotCache {
    store: Arc<SessionStore>,
    ttl: Duration,
    hit_record: HitRecorder,
    metrics: CacheMetrics,
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl SnapshotCache {
    /// Creates a cache over `store` with the given time-to-live.
    pub fn new(store: Arc<SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl, hit_record: HitRecorder::default(), metrics: CacheMetrics::default() }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Returns the cached list when a fresh, well-formed entry exists.
    /// Stale and malformed entries are removed and count as misses.
    pub fn load<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        account: Address,
        chain_id: u64,
    ) -> Option<Vec<T>> {
        let (prefix, chain) = key_parts(kind, chain_id);
        let key = cache_key(prefix, account, chain);
        let raw = match self.store.get(&key) {
            Some(raw) => raw,
            None => {
                self.hit_record.not_hit();
                return None;
            }
        };

        let snapshot: CachedSnapshot<T> = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(target: "chainflow::cache", key = key.as_str(), %err, "dropping malformed cache entry");
                self.store.remove(&key);
                self.hit_record.not_hit();
                return None;
            }
        };

        let age = now_ms().saturating_sub(snapshot.timestamp);
        if u128::from(age) > self.ttl.as_millis() {
            debug!(target: "chainflow::cache", key = key.as_str(), age_ms = age, "cache entry expired");
            self.store.remove(&key);
            self.hit_record.not_hit();
            return None;
        }

        self.hit_record.hit();
        Some(snapshot.data)
    }

    /// Stores a freshly synced list under the account's key.
    pub fn save<T: Serialize>(
        &self,
        kind: EntityKind,
        account: Address,
        chain_id: u64,
        data: &[T],
    ) {
        let (prefix, chain) = key_parts(kind, chain_id);
        let key = cache_key(prefix, account, chain);
        match serde_json::to_string(&SnapshotRef { data, timestamp: now_ms() }) {
            Ok(raw) => self.store.set(&key, raw),
            Err(err) => {
                warn!(target: "chainflow::cache", key = key.as_str(), %err, "failed to serialize cache entry");
            }
        }
    }

    /// Drops the entry for one kind and account.
    pub fn invalidate(&self, kind: EntityKind, account: Address, chain_id: u64) {
        let (prefix, chain) = key_parts(kind, chain_id);
        let key = cache_key(prefix, account, chain);
        self.store.remove(&key);
        debug!(target: "chainflow::cache", key = key.as_str(), "cache entry invalidated");
    }

    /// Drops every cached entity list, all accounts and chains. The
    /// transaction log is not a cache and survives this.
    pub fn invalidate_all(&self) {
        self.store.remove_prefixed(HABITS_PREFIX);
        self.store.remove_prefixed(TASKS_PREFIX);
        debug!(target: "chainflow::cache", "all cached entity lists invalidated");
    }

    /// Publishes hit ratio and size gauges.
    pub fn report_metrics(&self) {
        if let Some(hit_ratio) = self.hit_record.report() {
            self.metrics.cache_hit_ratio.set(hit_ratio);
        }
        self.metrics.cache_num_entries.set(self.store.len() as f64);
    }
}
