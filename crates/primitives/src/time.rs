//! Day-index math shared by the streak scanner and the check-in writes.
//!
//! The ledger stores check-ins against a UTC day index, defined as epoch
//! milliseconds divided by the milliseconds in a day, floored. Both sides of
//! the protocol (the `checkIn` write and the per-day read) use the same
//! index, so the helpers here are the single source of that conversion.

use chrono::Utc;

/// Milliseconds in one UTC day.
pub const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Converts an epoch-milliseconds timestamp to its UTC day index.
pub fn day_index(epoch_ms: u64) -> u64 {
    epoch_ms / MS_PER_DAY
}

/// The UTC day index of the current wall-clock time.
pub fn current_day_index() -> u64 {
    day_index(now_ms())
}

/// The epoch-milliseconds timestamp at which the given day index begins.
pub fn day_start_ms(day: u64) -> u64 {
    day * MS_PER_DAY
}
