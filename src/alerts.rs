// =============================================================================
// Alert Log — escalations the operator must see
// =============================================================================
//
// Raised when a safety action keeps failing (a close that will not fill, a
// monitor that cannot read the account) or when audit storage is lost. Every
// alert is logged at ERROR and kept in a bounded in-memory log for the query
// layer.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::error;

/// Maximum number of recent alerts to retain.
const MAX_RECENT_ALERTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A close order keeps failing.
    CloseRetrying,
    /// Balance or position polling keeps failing.
    MonitorDegraded,
    /// Ledger append failed; the account is halted.
    StorageFailure,
    /// Balance fell below the account floor.
    BalanceBreach,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CloseRetrying => write!(f, "close-retrying"),
            Self::MonitorDegraded => write!(f, "monitor-degraded"),
            Self::StorageFailure => write!(f, "storage-failure"),
            Self::BalanceBreach => write!(f, "balance-breach"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub account_id: String,
    pub kind: AlertKind,
    pub symbol: Option<String>,
    pub message: String,
    /// Consecutive failed attempts when the alert was raised.
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Bounded, shared log of recent alerts across all accounts.
#[derive(Debug, Default)]
pub struct AlertLog {
    recent: RwLock<VecDeque<Alert>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(
        &self,
        account_id: &str,
        kind: AlertKind,
        symbol: Option<&str>,
        attempts: u32,
        message: impl Into<String>,
    ) {
        let alert = Alert {
            account_id: account_id.to_string(),
            kind,
            symbol: symbol.map(str::to_string),
            message: message.into(),
            attempts,
            at: Utc::now(),
        };

        error!(
            account = %alert.account_id,
            kind = %alert.kind,
            symbol = ?alert.symbol,
            attempts,
            message = %alert.message,
            "ALERT"
        );

        let mut recent = self.recent.write();
        if recent.len() >= MAX_RECENT_ALERTS {
            recent.pop_front();
        }
        recent.push_back(alert);
    }

    /// Most recent alerts for `account_id`, newest first.
    pub fn for_account(&self, account_id: &str, count: usize) -> Vec<Alert> {
        self.recent
            .read()
            .iter()
            .rev()
            .filter(|a| a.account_id == account_id)
            .take(count)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn count_for(&self, account_id: &str, kind: AlertKind) -> usize {
        self.recent
            .read()
            .iter()
            .filter(|a| a.account_id == account_id && a.kind == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alerts_are_bounded_and_newest_first() {
        let log = AlertLog::new();
        for i in 0..(MAX_RECENT_ALERTS + 5) {
            log.raise("a", AlertKind::CloseRetrying, Some("BTCUSDT"), i as u32, "stuck");
        }
        log.raise("b", AlertKind::StorageFailure, None, 1, "disk full");

        let a = log.for_account("a", 3);
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].attempts, (MAX_RECENT_ALERTS + 4) as u32);
        assert_eq!(log.count_for("a", AlertKind::CloseRetrying), MAX_RECENT_ALERTS - 1);
        assert_eq!(log.count_for("b", AlertKind::StorageFailure), 1);
    }
}
