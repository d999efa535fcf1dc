//! Engine tuning knobs.
//!
//! Defaults mirror the deployed frontends: a five minute read cache, a 1.5x
//! gas buffer and a one second settle delay between confirmation and the
//! forced refresh. Every knob can be overridden through `CHAINFLOW_*`
//! environment variables at construction time.

use std::time::Duration;
use tracing::warn;

/// How inactive habits surface in synced lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InactiveHabits {
    /// Keep inactive habits in the list. Deployments whose ABI carries no
    /// active flag decode every habit as active, so this is the default.
    #[default]
    Keep,
    /// Drop inactive habits before caching the list.
    Hide,
}

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time-to-live for cached entity snapshots.
    pub cache_ttl: Duration,
    /// Forced refresh attempts after a creation confirms. The ledger can lag
    /// the receipt by a few blocks, so an empty result is retried.
    pub creation_refresh_attempts: u32,
    /// Fixed delay between creation refresh attempts.
    pub creation_refresh_delay: Duration,
    /// Re-read attempts after a failed entity count read.
    pub read_retry_attempts: u32,
    /// Fixed delay between count re-reads.
    pub read_retry_delay: Duration,
    /// Days scanned backward when deriving a streak, today inclusive.
    pub streak_horizon_days: u64,
    /// Gas limit buffer in tenths: the estimate is scaled by this value over
    /// ten, so 15 means a 1.5x margin.
    pub gas_buffer_tenths: u64,
    /// Pause between a confirmed receipt and the forced refresh, giving the
    /// endpoint time to serve post-transaction state.
    pub settle_delay: Duration,
    /// Receipt polling interval while a transaction is pending.
    pub receipt_poll_interval: Duration,
    /// How long to poll for a receipt before declaring the outcome unknown.
    pub receipt_timeout: Duration,
    /// Interval between event log polls.
    pub event_poll_interval: Duration,
    /// Upper bound on the block span of a single event poll.
    pub max_blocks_per_poll: u64,
    /// Whether inactive habits stay visible.
    pub inactive_habits: InactiveHabits,
    /// Retained transaction log entries per account.
    pub history_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            creation_refresh_attempts: 3,
            creation_refresh_delay: Duration::from_secs(2),
            read_retry_attempts: 2,
            read_retry_delay: Duration::from_secs(1),
            streak_horizon_days: 365,
            gas_buffer_tenths: 15,
            settle_delay: Duration::from_secs(1),
            receipt_poll_interval: Duration::from_secs(2),
            receipt_timeout: Duration::from_secs(120),
            event_poll_interval: Duration::from_secs(5),
            max_blocks_per_poll: 100,
            inactive_habits: InactiveHabits::default(),
            history_cap: 50,
        }
    }
}

impl EngineConfig {
    /// Builds a config from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_ms("CHAINFLOW_CACHE_TTL_MS") {
            config.cache_ttl = ms;
        }
        if let Some(ms) = env_ms("CHAINFLOW_SETTLE_DELAY_MS") {
            // The settle pause only makes sense in the one-to-five second
            // range; anything outside is clamped.
            config.settle_delay = ms.clamp(Duration::from_secs(1), Duration::from_secs(5));
        }
        if let Some(ms) = env_ms("CHAINFLOW_RECEIPT_TIMEOUT_MS") {
            config.receipt_timeout = ms;
        }
        if let Some(ms) = env_ms("CHAINFLOW_EVENT_POLL_MS") {
            config.event_poll_interval = ms;
        }
        if let Ok(raw) = std::env::var("CHAINFLOW_HIDE_INACTIVE") {
            config.inactive_habits = match raw.as_str() {
                "1" | "true" => InactiveHabits::Hide,
                "0" | "false" => InactiveHabits::Keep,
                other => {
                    warn!(target: "chainflow::config", value = other, "unrecognized CHAINFLOW_HIDE_INACTIVE, keeping default");
                    config.inactive_habits
                }
            };
        }
        config
    }
}

fn env_ms(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(target: "chainflow::config", var = name, value = raw.as_str(), "ignoring unparsable duration override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.gas_buffer_tenths, 15);
        assert_eq!(config.settle_delay, Duration::from_secs(1));
        assert_eq!(config.history_cap, 50);
        assert_eq!(config.inactive_habits, InactiveHabits::Keep);
    }

    #[test]
    fn settle_delay_is_clamped() {
        std::env::set_var("CHAINFLOW_SETTLE_DELAY_MS", "30000");
        let config = EngineConfig::from_env();
        assert_eq!(config.settle_delay, Duration::from_secs(5));
        std::env::remove_var("CHAINFLOW_SETTLE_DELAY_MS");
    }
}
