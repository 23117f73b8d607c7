// =============================================================================
// Exchange Gateway — the narrow capability the core depends on
// =============================================================================
//
// Four calls: place an order, read a position, read a price, read a balance.
// Concrete exchange adapters live outside the core; `paper` is the in-process adapter
// used by the binary and the tests.
// =============================================================================

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::registry::Account;
use crate::types::{OrderSide, PositionSide};

/// Confirmed fill of a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Exchange view of an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
}

/// Order placement and account queries against one exchange.
///
/// Implementations resolve `account.credentials()` themselves and must
/// classify failures: [`GatewayError::Transient`] for anything worth
/// retrying, [`GatewayError::Permanent`] for exchange rejections.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place a market order and wait for the fill.
    async fn place_order(
        &self,
        account: &Account,
        symbol: &str,
        side: OrderSide,
        size: f64,
    ) -> Result<Fill, GatewayError>;

    /// Current position in `symbol`, `None` when flat.
    async fn get_position(
        &self,
        account: &Account,
        symbol: &str,
    ) -> Result<Option<PositionState>, GatewayError>;

    /// Current price of `symbol`, independent of any position.
    async fn get_price(&self, account: &Account, symbol: &str) -> Result<f64, GatewayError>;

    /// Wallet balance in quote currency.
    async fn get_balance(&self, account: &Account) -> Result<f64, GatewayError>;
}
