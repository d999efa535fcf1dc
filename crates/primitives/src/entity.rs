//! Ledger-resident entity records and their local semantic mappings.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

/// Category of a tracked habit.
///
/// The ledger stores the category as a free-form string; the five canonical
/// values parse case-insensitively and anything else is carried verbatim in
/// [`HabitCategory::Other`] so client-side parsing never destroys data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum HabitCategory {
    /// Physical exercise routines.
    Fitness,
    /// Diet and eating habits.
    Nutrition,
    /// Meditation and mental health.
    Mindfulness,
    /// Work and focus routines.
    Productivity,
    /// Study and skill building.
    Learning,
    /// Any category string the canonical set does not cover.
    Other(String),
}

impl HabitCategory {
    /// Canonical lowercase label, or the original string for [`Self::Other`].
    pub fn as_str(&self) -> &str {
        match self {
            Self::Fitness => "fitness",
            Self::Nutrition => "nutrition",
            Self::Mindfulness => "mindfulness",
            Self::Productivity => "productivity",
            Self::Learning => "learning",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for HabitCategory {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "fitness" => Self::Fitness,
            "nutrition" => Self::Nutrition,
            "mindfulness" => Self::Mindfulness,
            "productivity" => Self::Productivity,
            "learning" => Self::Learning,
            _ => Self::Other(raw),
        }
    }
}

impl From<&str> for HabitCategory {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_owned())
    }
}

impl From<HabitCategory> for String {
    fn from(category: HabitCategory) -> Self {
        category.as_str().to_owned()
    }
}

impl std::fmt::Display for HabitCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A personal routine tracked by one account.
///
/// `id` is the dense ledger-assigned index (`0..count`). `streak`,
/// `last_checked_in_day` and `total_checkins` are derived client-side from
/// the per-day check-in log; the ledger itself only stores the booleans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Habit {
    /// Ledger-assigned sequential index.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Habit category.
    pub category: HabitCategory,
    /// Account that created the habit.
    pub creator: Address,
    /// Length of the unbroken check-in run ending today.
    pub streak: u32,
    /// Day index of the most recent check-in, if any.
    pub last_checked_in_day: Option<u64>,
    /// Total check-ins observed within the scan horizon.
    pub total_checkins: u32,
    /// Deactivation flag carried by some contract variants. Variants without
    /// the concept decode as `true`.
    pub active: bool,
}

impl Habit {
    /// A habit is visible to a client only if it created the habit.
    pub fn is_relevant_to(&self, account: Address) -> bool {
        self.creator == account
    }
}

/// Lifecycle state of a [`Task`].
///
/// The machine is strictly forward: `Assigned` -> `DoneByAssignee` ->
/// `ConfirmedByCreator`, with the last state terminal. The ledger enforces
/// who may perform each transition; locally the machine only answers what
/// the next legal state is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Created and waiting on the assignee.
    Assigned,
    /// Marked done by the assignee, waiting on the creator.
    DoneByAssignee,
    /// Confirmed by the creator. Terminal.
    ConfirmedByCreator,
}

impl TaskStatus {
    /// Maps a raw ledger status code. Unrecognized codes fall back to the
    /// initial state rather than failing the whole entity.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::DoneByAssignee,
            2 => Self::ConfirmedByCreator,
            _ => Self::Assigned,
        }
    }

    /// The raw code this state corresponds to.
    pub fn code(&self) -> u8 {
        match self {
            Self::Assigned => 0,
            Self::DoneByAssignee => 1,
            Self::ConfirmedByCreator => 2,
        }
    }

    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConfirmedByCreator)
    }

    /// The single state reachable from `self`, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Assigned => Some(Self::DoneByAssignee),
            Self::DoneByAssignee => Some(Self::ConfirmedByCreator),
            Self::ConfirmedByCreator => None,
        }
    }

    /// Whether `target` is the legal successor of `self`.
    pub fn can_advance_to(&self, target: Self) -> bool {
        self.next() == Some(target)
    }
}

/// A unit of work assigned by a creator account to an assignee account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Ledger-assigned sequential index.
    pub id: u64,
    /// Short title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Reward amount as a free-form string; not validated numerically.
    pub reward: String,
    /// Account that created the task.
    pub creator: Address,
    /// Account the task is assigned to.
    pub assignee: Address,
    /// Current lifecycle state.
    pub status: TaskStatus,
}

impl Task {
    /// A task is cache-relevant if the account is its creator or assignee.
    pub fn is_relevant_to(&self, account: Address) -> bool {
        self.creator == account || self.assignee == account
    }

    /// Lenient numeric reading of the reward string, `0.0` when unparsable.
    pub fn reward_value(&self) -> f64 {
        self.reward.trim().parse::<f64>().unwrap_or(0.0)
    }
}
