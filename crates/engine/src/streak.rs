//! Streak derivation from per-day check-in state.
//!
//! The ledger only stores which days a habit was checked in; streaks are
//! derived client side by scanning backward from today. The scan stops at
//! the first gap in the current run, so a habit not checked in today always
//! derives a zero streak regardless of its past. [`fold_checkin_days`]
//! produces the same summary from an event-sourced set of days without
//! issuing any reads.

use crate::{error::EngineError, gateway::EntityReader};
use alloy_primitives::{Address, B256, U256};
use alloy_rpc_types::Filter;
use alloy_sol_types::SolEvent;
use chainflow_primitives::current_day_index;
use chainflow_registry::{abi::CheckedIn, ChainProfile};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Derived streak state for one habit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreakSummary {
    /// Consecutive checked-in days ending today.
    pub streak: u32,
    /// Checked-in days seen within the scan horizon.
    pub total_checkins: u32,
    /// Most recent checked-in day, if any was seen.
    pub last_checked_in_day: Option<u64>,
}

/// Scans backward from today and derives the habit's streak.
///
/// At most `horizon_days + 1` reads are issued. A failed day read is
/// treated as not checked in, which can only shorten the derived run,
/// never corrupt it.
pub async fn compute_streak(
    reader: &dyn EntityReader,
    habit_id: u64,
    horizon_days: u64,
) -> StreakSummary {
    compute_streak_at(reader, habit_id, current_day_index(), horizon_days).await
}

pub(crate) async fn compute_streak_at(
    reader: &dyn EntityReader,
    habit_id: u64,
    today: u64,
    horizon_days: u64,
) -> StreakSummary {
    let floor = today.saturating_sub(horizon_days);
    let mut summary = StreakSummary::default();

    let mut day = today;
    loop {
        let checked = match reader.is_checked_in(habit_id, day).await {
            Ok(checked) => checked,
            Err(err) => {
                warn!(target: "chainflow::streak", habit_id, day, %err, "check-in read failed, treating day as unchecked");
                false
            }
        };

        if checked {
            summary.total_checkins += 1;
            let run_start = today.saturating_sub(u64::from(summary.streak));
            if day == today || (summary.streak > 0 && day == run_start) {
                summary.streak += 1;
                if summary.last_checked_in_day.is_none() {
                    summary.last_checked_in_day = Some(day);
                }
            }
        } else if day == today.saturating_sub(u64::from(summary.streak)) {
            // First gap in the current run. Older days cannot extend the
            // streak, so stop scanning entirely.
            break;
        }

        if day == floor {
            break;
        }
        day -= 1;
    }

    summary
}

/// Derives the same summary from a set of checked-in day indexes, as
/// recovered from check-in events. Days outside the scan window are
/// ignored so the result matches a fresh backward scan exactly.
pub fn fold_checkin_days<I>(days: I, today: u64, horizon_days: u64) -> StreakSummary
where
    I: IntoIterator<Item = u64>,
{
    let floor = today.saturating_sub(horizon_days);
    let checked: BTreeSet<u64> =
        days.into_iter().filter(|day| *day >= floor && *day <= today).collect();

    let mut summary = StreakSummary::default();
    let mut day = today;
    loop {
        if checked.contains(&day) {
            summary.total_checkins += 1;
            let run_start = today.saturating_sub(u64::from(summary.streak));
            if day == today || (summary.streak > 0 && day == run_start) {
                summary.streak += 1;
                if summary.last_checked_in_day.is_none() {
                    summary.last_checked_in_day = Some(day);
                }
            }
        } else if day == today.saturating_sub(u64::from(summary.streak)) {
            break;
        }

        if day == floor {
            break;
        }
        day -= 1;
    }

    summary
}

/// Rebuilds a streak from check-in events instead of per-day reads.
///
/// Pulls every `CheckedIn` log the habit contract emitted for this habit
/// and account, then folds the recovered days. One log query replaces up
/// to a year of check-in reads on endpoints that serve historical logs.
pub async fn streak_from_logs(
    client: &crate::client::LedgerClient,
    profile: &ChainProfile,
    account: Address,
    habit_id: u64,
    horizon_days: u64,
) -> Result<StreakSummary, EngineError> {
    let filter = Filter::new()
        .address(profile.habit_contract)
        .event_signature(CheckedIn::SIGNATURE_HASH)
        .topic1(B256::from(U256::from(habit_id)))
        .topic2(B256::from(account.into_word()))
        .from_block(0u64);

    let logs = client.get_logs(&filter).await.map_err(EngineError::Ledger)?;

    let mut days = Vec::with_capacity(logs.len());
    for log in &logs {
        match CheckedIn::decode_log_data(log.data()) {
            Ok(event) => match u64::try_from(event.dayIndex) {
                Ok(day) => days.push(day),
                Err(_) => {
                    warn!(target: "chainflow::streak", habit_id, "check-in event day index out of range, skipping");
                }
            },
            Err(err) => {
                warn!(target: "chainflow::streak", habit_id, %err, "undecodable check-in event, skipping");
            }
        }
    }

    let today = current_day_index();
    debug!(
        target: "chainflow::streak",
        habit_id,
        events = days.len(),
        "derived streak from event history"
    );
    Ok(fold_checkin_days(days, today, horizon_days))
}
