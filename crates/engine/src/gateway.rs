//! Typed entity reads over the raw call seam.
//!
//! [`EntityGateway`] turns [`LedgerCall`] byte traffic into domain entities
//! using the registry's codec, one read call per entity. Consumers depend on
//! the [`EntityReader`] trait so synchronization and streak derivation can
//! run against a scripted ledger in tests.

use crate::{client::LedgerCall, error::EngineError};
use alloy_primitives::Address;
use async_trait::async_trait;
use chainflow_primitives::{Habit, Task};
use chainflow_registry::{abi, AbiError, ChainProfile, EntityKind};

/// Read-only view of the entities a chain holds.
#[async_trait]
pub trait EntityReader: Send + Sync {
    /// Deployment this reader is bound to.
    fn profile(&self) -> &ChainProfile;

    /// Total habits ever created on the habit contract.
    async fn habit_count(&self) -> Result<u64, EngineError>;

    /// Loads one habit by index. Streak fields come back zeroed; derivation
    /// fills them in.
    async fn habit(&self, habit_id: u64) -> Result<Habit, EngineError>;

    /// Whether the habit was checked in on the given day.
    async fn is_checked_in(&self, habit_id: u64, day_index: u64) -> Result<bool, EngineError>;

    /// Total tasks ever created on the task contract.
    async fn task_count(&self) -> Result<u64, EngineError>;

    /// Loads one task by index.
    async fn task(&self, task_id: u64) -> Result<Task, EngineError>;

    /// Range read: every habit belonging to the account, one call. Only
    /// deployments with the batched ABI answer this.
    async fn user_habits(&self, account: Address) -> Result<Vec<Habit>, EngineError>;

    /// Range read: every task touching the account, one call.
    async fn user_tasks(&self, account: Address) -> Result<Vec<Task>, EngineError>;
}

/// Decoding gateway bound to one chain profile.
#[derive(Debug, Clone)]
pub struct EntityGateway<C> {
    profile: ChainProfile,
    caller: C,
}

impl<C: LedgerCall> EntityGateway<C> {
    /// Creates a gateway reading through `caller` against `profile`'s
    /// contracts.
    pub fn new(profile: ChainProfile, caller: C) -> Self {
        Self { profile, caller }
    }

    /// The underlying caller.
    pub fn caller(&self) -> &C {
        &self.caller
    }

    async fn read(
        &self,
        kind: EntityKind,
        input: alloy_primitives::Bytes,
    ) -> Result<alloy_primitives::Bytes, EngineError> {
        let to = self.profile.contract(kind);
        self.caller.call(to, input).await.map_err(EngineError::Ledger)
    }
}

fn decode_err(what: &'static str, err: AbiError) -> EngineError {
    EngineError::Ledger(anyhow::Error::new(err).context(format!("failed to decode {what}")))
}

#[async_trait]
impl<C: LedgerCall> EntityReader for EntityGateway<C> {
    fn profile(&self) -> &ChainProfile {
        &self.profile
    }

    async fn habit_count(&self) -> Result<u64, EngineError> {
        let data = self.read(EntityKind::Habits, abi::habit_count_call()).await?;
        abi::decode_count(&data).map_err(|err| decode_err("habit count", err))
    }

    async fn habit(&self, habit_id: u64) -> Result<Habit, EngineError> {
        let data = self.read(EntityKind::Habits, abi::habit_call(habit_id)).await?;
        abi::decode_habit(habit_id, &data).map_err(|err| decode_err("habit", err))
    }

    async fn is_checked_in(&self, habit_id: u64, day_index: u64) -> Result<bool, EngineError> {
        let data = self.read(EntityKind::Habits, abi::checkin_call(habit_id, day_index)).await?;
        abi::decode_checkin(&data).map_err(|err| decode_err("check-in flag", err))
    }

    async fn task_count(&self) -> Result<u64, EngineError> {
        let data = self.read(EntityKind::Tasks, abi::task_count_call()).await?;
        abi::decode_count(&data).map_err(|err| decode_err("task count", err))
    }

    async fn task(&self, task_id: u64) -> Result<Task, EngineError> {
        let data = self.read(EntityKind::Tasks, abi::task_call(task_id)).await?;
        abi::decode_task(task_id, &data).map_err(|err| decode_err("task", err))
    }

    async fn user_habits(&self, account: Address) -> Result<Vec<Habit>, EngineError> {
        let data = self.read(EntityKind::Habits, abi::user_habits_call(account)).await?;
        abi::decode_user_habits(&data).map_err(|err| decode_err("habit range", err))
    }

    async fn user_tasks(&self, account: Address) -> Result<Vec<Task>, EngineError> {
        let data = self.read(EntityKind::Tasks, abi::user_tasks_call(account)).await?;
        abi::decode_user_tasks(&data).map_err(|err| decode_err("task range", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCall;
    use alloy_primitives::{address, U256};
    use chainflow_primitives::TaskStatus;
    use chainflow_registry::{resolve, SOMNIA_TESTNET};

    const CREATOR: Address = address!("00000000000000000000000000000000000000aa");

    fn gateway(calls: MockCall) -> EntityGateway<MockCall> {
        EntityGateway::new(resolve(SOMNIA_TESTNET), calls)
    }

    #[tokio::test]
    async fn decodes_habit_count() {
        let calls = MockCall::default();
        let profile = resolve(SOMNIA_TESTNET);
        calls.set_sol_response(profile.habit_contract, abi::habit_count_call(), U256::from(4u64));

        let gw = gateway(calls);
        assert_eq!(gw.habit_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn decodes_habit_fields() {
        let calls = MockCall::default();
        let profile = resolve(SOMNIA_TESTNET);
        let payload = (
            "Morning run".to_string(),
            "5k before work".to_string(),
            "fitness".to_string(),
            CREATOR,
        );
        calls.set_sol_response(profile.habit_contract, abi::habit_call(2), payload);

        let gw = gateway(calls);
        let habit = gw.habit(2).await.unwrap();
        assert_eq!(habit.id, 2);
        assert_eq!(habit.name, "Morning run");
        assert_eq!(habit.creator, CREATOR);
        assert_eq!(habit.streak, 0);
    }

    #[tokio::test]
    async fn decodes_task_status_code() {
        let calls = MockCall::default();
        let profile = resolve(SOMNIA_TESTNET);
        let payload = (
            "Ship the report".to_string(),
            "Quarterly numbers".to_string(),
            "2.5".to_string(),
            CREATOR,
            1u16,
            CREATOR,
        );
        calls.set_sol_response(profile.task_contract, abi::task_call(0), payload);

        let gw = gateway(calls);
        let task = gw.task(0).await.unwrap();
        assert_eq!(task.status, TaskStatus::DoneByAssignee);
    }

    #[tokio::test]
    async fn garbage_response_is_an_error() {
        let calls = MockCall::default();
        let profile = resolve(SOMNIA_TESTNET);
        calls.set_response(
            profile.habit_contract,
            abi::habit_count_call(),
            alloy_primitives::Bytes::from_static(&[0xde, 0xad]),
        );

        let gw = gateway(calls);
        assert!(gw.habit_count().await.is_err());
    }

    #[tokio::test]
    async fn unscripted_call_is_an_error() {
        let gw = gateway(MockCall::default());
        assert!(gw.task_count().await.is_err());
    }
}
