//! Shared entity model for the chainflow state synchronization engine.
//!
//! Everything authoritative lives on the ledger; the types here are the
//! client-side mirror of that state plus the pure derivations (day math,
//! aggregate statistics) that the rest of the workspace builds on.

mod entity;
mod stats;
mod time;

pub use entity::{Habit, HabitCategory, Task, TaskStatus};
pub use stats::{HabitStats, TaskStats};
pub use time::{current_day_index, day_index, day_start_ms, now_ms, MS_PER_DAY};
