// =============================================================================
// Shared types used across the signal executor
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction requested by an inbound signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Long,
    Short,
    Close,
}

impl std::fmt::Display for SignalSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1.0 for longs, -1.0 for shorts.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Order side that opens or adds to a position of this side.
    pub fn opening_order(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position of this side.
    pub fn closing_order(self) -> OrderSide {
        self.opening_order().opposite()
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Side of an order sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for buys, -1.0 for sells.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Why an execution happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionCause {
    Signal,
    TrailingStop,
    BalanceBreach,
}

impl std::fmt::Display for ExecutionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::TrailingStop => write!(f, "trailing-stop"),
            Self::BalanceBreach => write!(f, "balance-breach"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Requested order size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSize {
    /// Absolute quantity in base units.
    Units(f64),
    /// Share of the account balance committed as margin, at the account's
    /// maximum leverage.
    Fraction(f64),
}

impl Default for SignalSize {
    fn default() -> Self {
        Self::Fraction(0.01)
    }
}

/// Which accounts a signal is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Targets {
    /// Every account registered (disabled ones answer with a rejection).
    #[default]
    All,
    Accounts(Vec<String>),
}

/// An externally decided trade intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: SignalSide,
    #[serde(default)]
    pub size: SignalSize,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub targets: Targets,
}

impl Signal {
    pub fn new(symbol: impl Into<String>, side: SignalSide, size: SignalSize) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            side,
            size,
            timestamp: Utc::now(),
            targets: Targets::All,
        }
    }

    /// Address the signal to an explicit list of accounts.
    pub fn for_accounts<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = Targets::Accounts(accounts.into_iter().map(Into::into).collect());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_order_is_opposite_of_opening() {
        assert_eq!(PositionSide::Long.closing_order(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_order(), OrderSide::Buy);
    }

    #[test]
    fn signal_json_defaults_to_all_targets() {
        let json = r#"{ "symbol": "BTCUSDT", "side": "long", "size": { "units": 0.5 } }"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.side, SignalSide::Long);
        assert_eq!(signal.size, SignalSize::Units(0.5));
        assert_eq!(signal.targets, Targets::All);
    }

    #[test]
    fn signal_json_with_explicit_accounts() {
        let json = r#"{
            "symbol": "ETHUSDT",
            "side": "close",
            "targets": { "accounts": ["account1"] }
        }"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.targets, Targets::Accounts(vec!["account1".into()]));
        assert_eq!(signal.size, SignalSize::Fraction(0.01));
    }
}
