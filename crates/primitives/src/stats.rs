//! Aggregate statistics derived from synced entity lists.

use crate::{Habit, Task};
use serde::{Deserialize, Serialize};

/// Habit aggregates for the active account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HabitStats {
    /// Number of habits owned by the account.
    pub total_habits: usize,
    /// Habits whose current streak is non-zero.
    pub active_streaks: usize,
    /// Sum of all check-ins across habits.
    pub total_checkins: u64,
    /// The longest current streak, `0` when there are no habits.
    pub longest_streak: u32,
}

impl HabitStats {
    /// Folds a synced habit list into its aggregates.
    pub fn collect(habits: &[Habit]) -> Self {
        Self {
            total_habits: habits.len(),
            active_streaks: habits.iter().filter(|h| h.streak > 0).count(),
            total_checkins: habits.iter().map(|h| u64::from(h.total_checkins)).sum(),
            longest_streak: habits.iter().map(|h| h.streak).max().unwrap_or(0),
        }
    }
}

/// Task aggregates for the active account.
///
/// Rewards only count once a task reaches its terminal state; an assigned or
/// merely submitted task contributes to `pending_tasks` instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Number of tasks the account participates in.
    pub total_tasks: usize,
    /// Tasks in the terminal state.
    pub completed_tasks: usize,
    /// Tasks still in flight.
    pub pending_tasks: usize,
    /// Sum of reward values over completed tasks, parsed leniently.
    pub total_rewards: f64,
}

impl TaskStats {
    /// Folds a synced task list into its aggregates.
    pub fn collect(tasks: &[Task]) -> Self {
        let completed = tasks.iter().filter(|t| t.status.is_terminal()).count();
        Self {
            total_tasks: tasks.len(),
            completed_tasks: completed,
            pending_tasks: tasks.len() - completed,
            total_rewards: tasks
                .iter()
                .filter(|t| t.status.is_terminal())
                .map(Task::reward_value)
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HabitCategory, TaskStatus};
    use alloy_primitives::Address;

    fn habit(id: u64, streak: u32, total: u32) -> Habit {
        Habit {
            id,
            name: format!("habit-{id}"),
            description: String::new(),
            category: HabitCategory::Fitness,
            creator: Address::ZERO,
            streak,
            last_checked_in_day: (total > 0).then_some(20_000),
            total_checkins: total,
            active: true,
        }
    }

    fn task(id: u64, reward: &str, status: TaskStatus) -> Task {
        Task {
            id,
            title: format!("task-{id}"),
            description: String::new(),
            reward: reward.to_owned(),
            creator: Address::ZERO,
            assignee: Address::ZERO,
            status,
        }
    }

    #[test]
    fn habit_stats_fold() {
        let habits = [habit(0, 3, 10), habit(1, 0, 2), habit(2, 7, 7)];
        let stats = HabitStats::collect(&habits);
        assert_eq!(stats.total_habits, 3);
        assert_eq!(stats.active_streaks, 2);
        assert_eq!(stats.total_checkins, 19);
        assert_eq!(stats.longest_streak, 7);
    }

    #[test]
    fn habit_stats_empty() {
        assert_eq!(HabitStats::collect(&[]), HabitStats::default());
    }

    #[test]
    fn rewards_count_only_after_terminal_state() {
        let tasks = [
            task(0, "10", TaskStatus::ConfirmedByCreator),
            task(1, "25", TaskStatus::DoneByAssignee),
            task(2, "5.5", TaskStatus::ConfirmedByCreator),
            task(3, "not-a-number", TaskStatus::ConfirmedByCreator),
            task(4, "100", TaskStatus::Assigned),
        ];

        let stats = TaskStats::collect(&tasks);
        assert_eq!(stats.total_tasks, 5);
        assert_eq!(stats.completed_tasks, 3);
        assert_eq!(stats.pending_tasks, 2);
        assert_eq!(stats.total_rewards, 15.5);
    }
}
