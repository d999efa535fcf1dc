//! Chain and contract resolution for the chainflow engine.
//!
//! Everything ABI- and deployment-specific lives in this crate: which chains
//! are supported, which contract serves which entity kind on each chain,
//! which ABI shape that contract speaks, and how engine actions encode into
//! calldata. The engine proper only ever sees the semantic entity model from
//! `chainflow-primitives` plus the [`ChainProfile`] handed out by
//! [`resolve`].

use alloy_primitives::{address, Address};
use once_cell::sync::Lazy;
use std::{collections::HashMap, time::Duration};
use url::Url;

pub mod abi;

pub use abi::{encode_action, function_name, Action, AbiError};

/// Somnia testnet, the primary deployment for both contracts.
pub const SOMNIA_TESTNET: u64 = 50312;
/// Somnia mainnet, task board only.
pub const SOMNIA_MAINNET: u64 = 5031;
/// Base mainnet, task board only.
pub const BASE_MAINNET: u64 = 8453;

/// Habit log deployment on Somnia testnet.
pub const HABIT_CONTRACT_SOMNIA_TESTNET: Address =
    address!("b07bbd46ec078d7a990a87999acac46a9c737a47");
/// Task board deployment on Somnia testnet, also the unsupported-chain fallback.
pub const TASK_CONTRACT_SOMNIA_TESTNET: Address =
    address!("bffddeb4ae3ad53df99a556324245de7c0001ca4");
/// Task board deployment on Base mainnet.
pub const TASK_CONTRACT_BASE: Address = address!("86D160b97534069E33362a713f47CFc8BD503346");
/// Task board deployment on Somnia mainnet.
pub const TASK_CONTRACT_SOMNIA_MAINNET: Address =
    address!("C28825AA274098Ff80e910BB8eC932456d4fdfD5");

/// Per-endpoint request timeout.
pub const RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Transport-level retries per request.
pub const RPC_RETRY_COUNT: usize = 3;
/// Fixed delay between transport retries.
pub const RPC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Which ledger-resident collection a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Personal habit log.
    Habits,
    /// Team task board.
    Tasks,
}

/// Contract ABI shape spoken by a deployment.
///
/// `PerIndex` is the count-plus-index surface the engine's O(n) sync loop is
/// written against. `Batched` adds user-scoped range reads
/// (`getUserHabits` / `getUserTasks`) that return the relevant entities in
/// one call; sync switches to them when the profile advertises this shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiVariant {
    /// Entity count read plus one read per index.
    PerIndex,
    /// User-scoped range reads returning pre-filtered views.
    Batched,
}

/// Resolved deployment facts for one chain.
#[derive(Debug, Clone)]
pub struct ChainProfile {
    /// Numeric chain identifier.
    pub chain_id: u64,
    /// Human-readable network name.
    pub name: &'static str,
    /// RPC endpoints in failover order.
    pub endpoints: &'static [&'static str],
    /// Habit log address used on this chain.
    pub habit_contract: Address,
    /// Task board address used on this chain.
    pub task_contract: Address,
    /// ABI shape of the deployments on this chain.
    pub abi: AbiVariant,
    /// Whether writes may target this chain. Unsupported profiles carry the
    /// fallback addresses and exist only so reads have something to show.
    pub supported: bool,
}

impl ChainProfile {
    /// Contract address serving the given entity kind.
    pub fn contract(&self, kind: EntityKind) -> Address {
        match kind {
            EntityKind::Habits => self.habit_contract,
            EntityKind::Tasks => self.task_contract,
        }
    }

    /// Parsed endpoint list, skipping anything unparsable.
    pub fn endpoint_urls(&self) -> Vec<Url> {
        self.endpoints.iter().filter_map(|raw| Url::parse(raw).ok()).collect()
    }
}

static PROFILES: Lazy<HashMap<u64, ChainProfile>> = Lazy::new(|| {
    let mut profiles = HashMap::new();
    profiles.insert(
        SOMNIA_TESTNET,
        ChainProfile {
            chain_id: SOMNIA_TESTNET,
            name: "Somnia Testnet",
            endpoints: &[
                "https://dream-rpc.somnia.network",
                "https://rpc.testnet.somnia.network",
            ],
            habit_contract: HABIT_CONTRACT_SOMNIA_TESTNET,
            task_contract: TASK_CONTRACT_SOMNIA_TESTNET,
            abi: AbiVariant::PerIndex,
            supported: true,
        },
    );
    profiles.insert(
        SOMNIA_MAINNET,
        ChainProfile {
            chain_id: SOMNIA_MAINNET,
            name: "Somnia Mainnet",
            endpoints: &["https://api.infra.mainnet.somnia.network"],
            habit_contract: HABIT_CONTRACT_SOMNIA_TESTNET,
            task_contract: TASK_CONTRACT_SOMNIA_MAINNET,
            abi: AbiVariant::PerIndex,
            supported: true,
        },
    );
    profiles.insert(
        BASE_MAINNET,
        ChainProfile {
            chain_id: BASE_MAINNET,
            name: "Base Mainnet",
            endpoints: &[
                "https://base.gateway.tenderly.co",
                "https://base-mainnet.public.blastapi.io",
                "https://base.llamarpc.com",
                "https://base-rpc.publicnode.com",
                "https://base.meowrpc.com",
                "https://mainnet.base.org",
            ],
            habit_contract: HABIT_CONTRACT_SOMNIA_TESTNET,
            task_contract: TASK_CONTRACT_BASE,
            abi: AbiVariant::Batched,
            supported: true,
        },
    );
    profiles
});

/// Resolves a chain id to its deployment profile.
///
/// Unknown ids resolve to the Somnia testnet addresses with `supported`
/// cleared; the executor refuses writes against such a profile outright
/// instead of submitting to the wrong address.
pub fn resolve(chain_id: u64) -> ChainProfile {
    match PROFILES.get(&chain_id) {
        Some(profile) => profile.clone(),
        None => {
            let mut fallback = PROFILES[&SOMNIA_TESTNET].clone();
            fallback.chain_id = chain_id;
            fallback.name = "Unsupported Network";
            fallback.supported = false;
            fallback
        }
    }
}

/// Whether the chain id is in the supported set.
pub fn is_supported(chain_id: u64) -> bool {
    PROFILES.contains_key(&chain_id)
}

/// Chain ids with known deployments, in ascending order.
pub fn supported_chains() -> Vec<u64> {
    let mut chains: Vec<u64> = PROFILES.keys().copied().collect();
    chains.sort_unstable();
    chains
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_chains() {
        let somnia = resolve(SOMNIA_TESTNET);
        assert!(somnia.supported);
        assert_eq!(somnia.habit_contract, HABIT_CONTRACT_SOMNIA_TESTNET);
        assert_eq!(somnia.task_contract, TASK_CONTRACT_SOMNIA_TESTNET);
        assert_eq!(somnia.abi, AbiVariant::PerIndex);

        let base = resolve(BASE_MAINNET);
        assert!(base.supported);
        assert_eq!(base.contract(EntityKind::Tasks), TASK_CONTRACT_BASE);
        assert_eq!(base.abi, AbiVariant::Batched);

        let mainnet = resolve(SOMNIA_MAINNET);
        assert_eq!(mainnet.contract(EntityKind::Tasks), TASK_CONTRACT_SOMNIA_MAINNET);
    }

    #[test]
    fn unknown_chain_falls_back_unsupported() {
        let profile = resolve(1);
        assert!(!profile.supported);
        assert_eq!(profile.chain_id, 1);
        // Fallback carries the default deployment so reads still resolve.
        assert_eq!(profile.task_contract, TASK_CONTRACT_SOMNIA_TESTNET);
        assert!(!is_supported(1));
    }

    #[test]
    fn supported_set_is_exactly_the_known_deployments() {
        assert_eq!(supported_chains(), vec![SOMNIA_MAINNET, BASE_MAINNET, SOMNIA_TESTNET]);
    }

    #[test]
    fn endpoints_parse() {
        for chain in supported_chains() {
            let profile = resolve(chain);
            let urls = profile.endpoint_urls();
            assert_eq!(urls.len(), profile.endpoints.len(), "chain {chain}");
        }
    }
}
