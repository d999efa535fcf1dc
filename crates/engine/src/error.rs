//! Failure taxonomy for the sync engine.
//!
//! Raw transport and contract errors carry long, provider-specific messages.
//! Everything that crosses the engine boundary is folded into one of the
//! variants below so callers can branch on the class instead of string
//! matching, and [`EngineError::user_hint`] renders the short actionable
//! line a frontend would show.

use crate::executor::OpCategory;

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A write was requested without a bound signer.
    #[error("wallet required")]
    WalletRequired,
    /// The session targets a chain with no known deployment.
    #[error("network {chain_id} is not supported")]
    UnsupportedNetwork {
        /// Chain the session is connected to.
        chain_id: u64,
    },
    /// The wallet is connected to the wrong chain for this operation. The
    /// engine never retargets on its own; callers switch and retry.
    #[error("connected to chain {current} but chain {required} is required")]
    NetworkSwitchRequired {
        /// Chain the wallet is currently on.
        current: u64,
        /// Chain the operation must run on.
        required: u64,
    },
    /// Another write of the same category has not settled yet.
    #[error("a {category} operation is already in flight")]
    OperationInFlight {
        /// Category of the blocked slot.
        category: OpCategory,
    },
    /// The gas estimate call failed, usually because the call would revert.
    #[error("gas estimation failed: {0}")]
    GasEstimationFailed(String),
    /// The account cannot cover gas for the transaction.
    #[error("insufficient funds for gas")]
    InsufficientFunds,
    /// The explicit nonce no longer matches the account state.
    #[error("nonce mismatch")]
    NonceError,
    /// The contract reverted the transaction.
    #[error("rejected by contract: {reason}")]
    ContractRejected {
        /// Decoded or raw revert reason.
        reason: String,
    },
    /// No receipt was observed within the deadline. The transaction may
    /// still land; its status is unknown, not failed.
    #[error("confirmation timed out")]
    ConfirmationTimedOut,
    /// A read or transport call failed after retries.
    #[error("ledger request failed: {0}")]
    Ledger(#[from] anyhow::Error),
    /// Nothing in the taxonomy matched; the original message passes through.
    #[error("{0}")]
    Unknown(String),
}

impl EngineError {
    /// Classifies a write-path failure from its message text.
    ///
    /// The match order is significant: a message mentioning both funds and
    /// gas is a funds problem, and nonce complaints outrank generic gas
    /// noise. Revert reasons are recognized last so provider wrappers do not
    /// shadow the more specific classes.
    pub fn classify_failure(message: &str) -> Self {
        let lowered = message.to_lowercase();
        if lowered.contains("insufficient funds") {
            return Self::InsufficientFunds;
        }
        if lowered.contains("nonce") {
            return Self::NonceError;
        }
        if lowered.contains("gas") {
            return Self::GasEstimationFailed(message.to_owned());
        }
        if let Some(reason) = extract_revert_reason(message) {
            return Self::ContractRejected { reason };
        }
        Self::Unknown(message.to_owned())
    }

    /// Whether the failure is an expected outcome rather than a fault. A
    /// contract turning down a duplicate check-in is business as usual and
    /// should not be logged or surfaced as an error.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::ContractRejected { .. })
    }

    /// Short actionable line for display next to the failed operation.
    pub fn user_hint(&self) -> String {
        match self {
            Self::WalletRequired => "Please connect your wallet first".to_owned(),
            Self::UnsupportedNetwork { .. } => {
                "This network is not supported - please switch networks".to_owned()
            }
            Self::NetworkSwitchRequired { .. } => {
                "Network switch required - please switch to the required network".to_owned()
            }
            Self::OperationInFlight { .. } => {
                "Please wait for the current transaction to finish".to_owned()
            }
            Self::GasEstimationFailed(_) => "Gas estimation failed - please try again".to_owned(),
            Self::InsufficientFunds => "Insufficient funds for gas fees".to_owned(),
            Self::NonceError => "Nonce error - please try again".to_owned(),
            Self::ContractRejected { reason } => {
                if reason.to_lowercase().contains("already checked in") {
                    "Already checked in today - keep it up tomorrow!".to_owned()
                } else {
                    format!("The contract declined this action: {reason}")
                }
            }
            Self::ConfirmationTimedOut => {
                "Transaction is taking longer than expected - check the explorer for its status"
                    .to_owned()
            }
            Self::Ledger(_) => "Network request failed - please try again".to_owned(),
            Self::Unknown(message) => {
                if message.is_empty() {
                    "Transaction failed".to_owned()
                } else {
                    message.clone()
                }
            }
        }
    }
}

/// Pulls the human part out of a revert message, if there is one.
fn extract_revert_reason(message: &str) -> Option<String> {
    let lowered = message.to_lowercase();
    let idx = lowered.find("revert")?;
    // Common shapes: "execution reverted: <reason>" and
    // "reverted with reason string '<reason>'". Offsets come from the
    // lowercased copy, which can drift on non-ASCII input.
    let Some(tail) = message.get(idx..) else {
        return Some("execution reverted".to_owned());
    };
    if let Some(colon) = tail.find(':') {
        let reason = tail[colon + 1..].trim().trim_matches('\'').trim();
        if !reason.is_empty() {
            return Some(reason.to_owned());
        }
    }
    if let Some(start) = tail.find('\'') {
        let rest = &tail[start + 1..];
        if let Some(end) = rest.find('\'') {
            let reason = rest[..end].trim();
            if !reason.is_empty() {
                return Some(reason.to_owned());
            }
        }
    }
    Some("execution reverted".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn funds_outrank_gas() {
        let err = EngineError::classify_failure(
            "insufficient funds for gas * price + value: balance 0",
        );
        assert_matches!(err, EngineError::InsufficientFunds);
    }

    #[test]
    fn nonce_outranks_gas() {
        let err = EngineError::classify_failure("nonce too low: next nonce 7, tx nonce 3");
        assert_matches!(err, EngineError::NonceError);
    }

    #[test]
    fn gas_complaints_classify() {
        let err = EngineError::classify_failure("intrinsic gas too low");
        assert_matches!(err, EngineError::GasEstimationFailed(_));
    }

    #[test]
    fn revert_reason_is_extracted() {
        let err =
            EngineError::classify_failure("execution reverted: Already checked in today");
        assert_matches!(
            err,
            EngineError::ContractRejected { reason } if reason == "Already checked in today"
        );
    }

    #[test]
    fn quoted_revert_reason_is_extracted() {
        let err = EngineError::classify_failure("reverted with reason string 'Not the assignee'");
        assert_matches!(
            err,
            EngineError::ContractRejected { reason } if reason == "Not the assignee"
        );
    }

    #[test]
    fn bare_revert_keeps_generic_reason() {
        let err = EngineError::classify_failure("execution reverted");
        assert_matches!(
            err,
            EngineError::ContractRejected { reason } if reason == "execution reverted"
        );
    }

    #[test]
    fn unmatched_text_passes_through() {
        let err = EngineError::classify_failure("something odd happened");
        assert_matches!(err, EngineError::Unknown(message) if message == "something odd happened");
    }

    #[test]
    fn duplicate_checkin_is_soft_with_friendly_hint() {
        let err = EngineError::classify_failure("execution reverted: Already checked in today");
        assert!(err.is_soft());
        assert!(err.user_hint().starts_with("Already checked in today"));
    }

    #[test]
    fn timeout_is_not_a_failure_hint() {
        let hint = EngineError::ConfirmationTimedOut.user_hint();
        assert!(hint.contains("longer than expected"));
    }

    #[test]
    fn empty_unknown_falls_back() {
        assert_eq!(EngineError::Unknown(String::new()).user_hint(), "Transaction failed");
    }
}
