//! Contract bindings and the engine-action calldata codec.
//!
//! Two ABI shapes exist in the wild for the same deployments. The `PerIndex`
//! surface exposes an entity count plus one read per index; the `Batched`
//! surface adds user-scoped range reads that come back pre-filtered. Both
//! share write and event signatures. Decoders translate raw return data into
//! the semantic model; nothing outside this module touches calldata.

#![allow(missing_docs)]

use crate::EntityKind;
use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_macro::sol;
use alloy_sol_types::SolCall;
use chainflow_primitives::{Habit, HabitCategory, Task, TaskStatus};

sol! {
    /// Habit log, per-index surface.
    contract HabitLog {
        event HabitCreated(uint256 indexed habitId, address indexed creator);
        event CheckedIn(uint256 indexed habitId, address indexed account, uint256 dayIndex);

        function getHabitsCount() external view returns (uint256);
        function getHabit(uint256 habitId)
            external
            view
            returns (string name, string description, string category, address creator);
        function isCheckedIn(uint256 habitId, uint256 dayIndex) external view returns (bool);
        function createHabit(string name, string description, string category) external;
        function checkIn(uint256 habitId, uint256 dayIndex) external;
    }
}

sol! {
    /// Habit log, batched surface.
    contract HabitLogBatched {
        struct HabitView {
            uint256 id;
            string name;
            string description;
            string category;
            address creator;
            bool active;
        }

        function getUserHabits(address account) external view returns (HabitView[] habits);
    }
}

sol! {
    /// Task board, per-index surface.
    contract TaskBoard {
        event TaskCreated(uint256 indexed taskId, address indexed creator, address indexed assignee);
        event TaskSubmitted(uint256 indexed taskId);
        event TaskVerified(uint256 indexed taskId);

        function getTasksCount() external view returns (uint256);
        function getTask(uint256 _taskId)
            external
            view
            returns (
                string title,
                string description,
                string reward,
                address assignee,
                uint8 status,
                address creator
            );
        function createTask(string _title, string _description, address _assignee, string _reward) external;
        function submitTask(uint256 _taskId) external;
        function verifyTask(uint256 _taskId) external;
    }
}

sol! {
    /// Task board, batched surface. Older deployments collapse the status
    /// machine into a completed flag.
    contract TaskBoardBatched {
        struct TaskView {
            uint256 id;
            string title;
            string description;
            string reward;
            address assignee;
            bool completed;
            address creator;
        }

        function getUserTasks(address account) external view returns (TaskView[] tasks);
    }
}

pub use HabitLog::{CheckedIn, HabitCreated};
pub use TaskBoard::{TaskCreated, TaskSubmitted, TaskVerified};

/// Failures while decoding contract return data.
#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    /// The raw bytes did not match the expected ABI shape.
    #[error("return data decode failed: {0}")]
    Decode(#[from] alloy_sol_types::Error),
    /// The bytes decoded but the value is unusable.
    #[error("{0}")]
    Value(&'static str),
}

fn to_u64(value: U256, what: &'static str) -> Result<u64, AbiError> {
    u64::try_from(value).map_err(|_| AbiError::Value(what))
}

/// A mutating ledger operation the engine can submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create a new habit owned by the sender.
    CreateHabit {
        /// Display name.
        name: String,
        /// Free-form description.
        description: String,
        /// Habit category.
        category: HabitCategory,
    },
    /// Record a check-in for a habit on a UTC day index.
    CheckIn {
        /// Target habit.
        habit_id: u64,
        /// UTC day index being checked in.
        day_index: u64,
    },
    /// Create a new task assigned to another account.
    CreateTask {
        /// Short title.
        title: String,
        /// Free-form description.
        description: String,
        /// Account the task is assigned to.
        assignee: Address,
        /// Reward amount as a free-form string.
        reward: String,
    },
    /// Assignee marks a task done.
    SubmitTask {
        /// Target task.
        task_id: u64,
    },
    /// Creator confirms a submitted task.
    VerifyTask {
        /// Target task.
        task_id: u64,
    },
}

impl Action {
    /// The collection this action mutates.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::CreateHabit { .. } | Self::CheckIn { .. } => EntityKind::Habits,
            Self::CreateTask { .. } | Self::SubmitTask { .. } | Self::VerifyTask { .. } => {
                EntityKind::Tasks
            }
        }
    }

    /// Short human-readable description for history entries.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateHabit { name, .. } => format!("Create habit \"{name}\""),
            Self::CheckIn { habit_id, day_index } => {
                format!("Check in habit #{habit_id} (day {day_index})")
            }
            Self::CreateTask { title, .. } => format!("Create task \"{title}\""),
            Self::SubmitTask { task_id } => format!("Submit task #{task_id}"),
            Self::VerifyTask { task_id } => format!("Verify task #{task_id}"),
        }
    }
}

/// Contract function name an action encodes to, for logging.
pub fn function_name(action: &Action) -> &'static str {
    match action {
        Action::CreateHabit { .. } => "createHabit",
        Action::CheckIn { .. } => "checkIn",
        Action::CreateTask { .. } => "createTask",
        Action::SubmitTask { .. } => "submitTask",
        Action::VerifyTask { .. } => "verifyTask",
    }
}

/// Encodes an action into calldata for its target contract.
pub fn encode_action(action: &Action) -> Bytes {
    let calldata = match action {
        Action::CreateHabit { name, description, category } => HabitLog::createHabitCall {
            name: name.clone(),
            description: description.clone(),
            category: category.to_string(),
        }
        .abi_encode(),
        Action::CheckIn { habit_id, day_index } => HabitLog::checkInCall {
            habitId: U256::from(*habit_id),
            dayIndex: U256::from(*day_index),
        }
        .abi_encode(),
        Action::CreateTask { title, description, assignee, reward } => TaskBoard::createTaskCall {
            _title: title.clone(),
            _description: description.clone(),
            _assignee: *assignee,
            _reward: reward.clone(),
        }
        .abi_encode(),
        Action::SubmitTask { task_id } => {
            TaskBoard::submitTaskCall { _taskId: U256::from(*task_id) }.abi_encode()
        }
        Action::VerifyTask { task_id } => {
            TaskBoard::verifyTaskCall { _taskId: U256::from(*task_id) }.abi_encode()
        }
    };
    calldata.into()
}

/// Calldata for the habit count read.
pub fn habit_count_call() -> Bytes {
    HabitLog::getHabitsCountCall {}.abi_encode().into()
}

/// Calldata for a per-index habit read.
pub fn habit_call(habit_id: u64) -> Bytes {
    HabitLog::getHabitCall { habitId: U256::from(habit_id) }.abi_encode().into()
}

/// Calldata for a per-day check-in read.
pub fn checkin_call(habit_id: u64, day_index: u64) -> Bytes {
    HabitLog::isCheckedInCall { habitId: U256::from(habit_id), dayIndex: U256::from(day_index) }
        .abi_encode()
        .into()
}

/// Calldata for the task count read.
pub fn task_count_call() -> Bytes {
    TaskBoard::getTasksCountCall {}.abi_encode().into()
}

/// Calldata for a per-index task read.
pub fn task_call(task_id: u64) -> Bytes {
    TaskBoard::getTaskCall { _taskId: U256::from(task_id) }.abi_encode().into()
}

/// Calldata for the user-scoped habit range read (batched surface).
pub fn user_habits_call(account: Address) -> Bytes {
    HabitLogBatched::getUserHabitsCall { account }.abi_encode().into()
}

/// Calldata for the user-scoped task range read (batched surface).
pub fn user_tasks_call(account: Address) -> Bytes {
    TaskBoardBatched::getUserTasksCall { account }.abi_encode().into()
}

/// Decodes an entity count return.
pub fn decode_count(data: &[u8]) -> Result<u64, AbiError> {
    let count = HabitLog::getHabitsCountCall::abi_decode_returns(data)?;
    to_u64(count, "entity count exceeds u64")
}

/// Decodes a per-index habit read. Streak fields start at zero; the streak
/// scanner fills them in afterwards.
pub fn decode_habit(habit_id: u64, data: &[u8]) -> Result<Habit, AbiError> {
    let raw = HabitLog::getHabitCall::abi_decode_returns(data)?;
    Ok(Habit {
        id: habit_id,
        name: raw.name,
        description: raw.description,
        category: HabitCategory::from(raw.category),
        creator: raw.creator,
        streak: 0,
        last_checked_in_day: None,
        total_checkins: 0,
        active: true,
    })
}

/// Decodes a per-day check-in read.
pub fn decode_checkin(data: &[u8]) -> Result<bool, AbiError> {
    Ok(HabitLog::isCheckedInCall::abi_decode_returns(data)?)
}

/// Decodes a per-index task read. Unrecognized status codes map to the
/// initial state.
pub fn decode_task(task_id: u64, data: &[u8]) -> Result<Task, AbiError> {
    let raw = TaskBoard::getTaskCall::abi_decode_returns(data)?;
    Ok(Task {
        id: task_id,
        title: raw.title,
        description: raw.description,
        reward: raw.reward,
        creator: raw.creator,
        assignee: raw.assignee,
        status: TaskStatus::from_code(raw.status),
    })
}

/// Decodes a user-scoped habit range read.
pub fn decode_user_habits(data: &[u8]) -> Result<Vec<Habit>, AbiError> {
    let views = HabitLogBatched::getUserHabitsCall::abi_decode_returns(data)?;
    views
        .into_iter()
        .map(|view| {
            Ok(Habit {
                id: to_u64(view.id, "habit id exceeds u64")?,
                name: view.name,
                description: view.description,
                category: HabitCategory::from(view.category),
                creator: view.creator,
                streak: 0,
                last_checked_in_day: None,
                total_checkins: 0,
                active: view.active,
            })
        })
        .collect()
}

/// Decodes a user-scoped task range read. The batched surface only carries a
/// completed flag, which maps to the two ends of the status machine.
pub fn decode_user_tasks(data: &[u8]) -> Result<Vec<Task>, AbiError> {
    let views = TaskBoardBatched::getUserTasksCall::abi_decode_returns(data)?;
    views
        .into_iter()
        .map(|view| {
            Ok(Task {
                id: to_u64(view.id, "task id exceeds u64")?,
                title: view.title,
                description: view.description,
                reward: view.reward,
                creator: view.creator,
                assignee: view.assignee,
                status: if view.completed {
                    TaskStatus::ConfirmedByCreator
                } else {
                    TaskStatus::Assigned
                },
            })
        })
        .collect()
}
