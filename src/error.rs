// =============================================================================
// Error taxonomy
// =============================================================================
//
//   RiskRejection  — local validation failure, reported to the submitter.
//   GatewayError   — exchange call failure, split into transient (retried)
//                    and permanent (surfaced immediately).
//   LedgerError    — audit storage unavailable; halts the account.
//   DispatchError  — what a submitter sees when an accepted signal fails.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason a signal was refused before any order was sent.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RiskRejection {
    #[error("account is disabled")]
    AccountDisabled,

    #[error("account is halted until the ledger is available: {cause}")]
    AccountHalted { cause: String },

    #[error("unknown account")]
    UnknownAccount,

    #[error("exceeds max position size: resulting {resulting}, limit {limit}")]
    ExceedsMaxPositionSize { resulting: f64, limit: f64 },

    #[error("exceeds max leverage: implied {implied:.2}x, limit {limit:.2}x")]
    ExceedsMaxLeverage { implied: f64, limit: f64 },

    #[error("projected balance {projected:.2} below floor {floor:.2}")]
    BalanceFloor { projected: f64, floor: f64 },

    #[error("no open position to close")]
    NothingToClose,

    #[error("invalid signal: {detail}")]
    InvalidSignal { detail: String },
}

/// Failure reported by (or while talking to) the exchange gateway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Network or exchange-side hiccup worth retrying.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// The call did not complete within the configured deadline.
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    /// The exchange refused the request (invalid symbol, insufficient
    /// margin, ...). Retrying will not help.
    #[error("exchange rejected request: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Audit storage failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("ledger storage unavailable: {0}")]
    Storage(String),
}

/// Failure of a signal that passed risk checks.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("order failed after {attempts} attempt(s): {source}")]
    Gateway {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    /// The order filled but could not be written to the ledger.
    #[error("order filled but not recorded: {0}")]
    Storage(#[from] LedgerError),

    /// Shutdown interrupted a close; the position is left Closing.
    #[error("close abandoned on shutdown after {attempts} attempt(s)")]
    CloseAbandoned { attempts: u32 },

    #[error("account worker is not running")]
    WorkerUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_network_errors_are_transient() {
        assert!(GatewayError::Transient("reset by peer".into()).is_transient());
        assert!(GatewayError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(!GatewayError::Permanent("invalid symbol".into()).is_transient());
    }

    #[test]
    fn rejection_reason_is_human_readable() {
        let r = RiskRejection::ExceedsMaxPositionSize {
            resulting: 11.0,
            limit: 10.0,
        };
        assert_eq!(
            r.to_string(),
            "exceeds max position size: resulting 11, limit 10"
        );
    }
}
