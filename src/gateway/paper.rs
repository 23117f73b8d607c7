// =============================================================================
// Paper Gateway — in-process simulated exchange
// =============================================================================
//
// Fills every market order instantly at the configured mark price, tracks
// per-account holdings with the same arithmetic as the live position book,
// and credits realised PnL to the wallet balance.
//
// Only accounts whose credential handle starts with `paper` are served.
// Failure injection (scripted errors, artificial latency) makes it the test
// double for everything above the gateway seam.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExchangeGateway, Fill, PositionState};
use crate::config::PaperSettings;
use crate::error::GatewayError;
use crate::position::{Holding, SIZE_EPSILON};
use crate::registry::Account;
use crate::types::OrderSide;

#[derive(Default)]
struct PaperBook {
    prices: HashMap<String, f64>,
    balances: HashMap<String, f64>,
    holdings: HashMap<(String, String), Holding>,
    #[cfg(test)]
    fills: HashMap<String, Vec<Fill>>,
    #[cfg(test)]
    order_calls: HashMap<String, u64>,
    order_errors: HashMap<String, VecDeque<GatewayError>>,
    balance_errors: HashMap<String, VecDeque<GatewayError>>,
    latency: Option<Duration>,
}

/// Simulated exchange shared by all accounts.
pub struct PaperGateway {
    book: Mutex<PaperBook>,
    starting_balance: f64,
}

impl PaperGateway {
    /// Create a paper exchange where every account starts with
    /// `starting_balance`.
    pub fn new(starting_balance: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            starting_balance,
        }
    }

    pub fn from_settings(settings: &PaperSettings) -> Self {
        let gateway = Self::new(settings.starting_balance);
        for (symbol, price) in &settings.prices {
            gateway.set_price(symbol, *price);
        }
        info!(
            starting_balance = settings.starting_balance,
            symbols = settings.prices.len(),
            "paper gateway initialised"
        );
        gateway
    }

    // -------------------------------------------------------------------------
    // Market / account control
    // -------------------------------------------------------------------------

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.book.lock().prices.insert(symbol.to_uppercase(), price);
    }

    pub fn set_balance(&self, account_id: &str, balance: f64) {
        self.book.lock().balances.insert(account_id.to_string(), balance);
    }

    #[cfg(test)]
    /// Delay every call by `latency` (before touching the book).
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.book.lock().latency = latency;
    }

    #[cfg(test)]
    /// Make the next order placements for `account_id` fail with `errors`,
    /// in order.
    pub fn fail_next_orders<I>(&self, account_id: &str, errors: I)
    where
        I: IntoIterator<Item = GatewayError>,
    {
        self.book
            .lock()
            .order_errors
            .entry(account_id.to_string())
            .or_default()
            .extend(errors);
    }

    #[cfg(test)]
    /// Make the next balance reads for `account_id` fail with `errors`.
    pub fn fail_next_balances<I>(&self, account_id: &str, errors: I)
    where
        I: IntoIterator<Item = GatewayError>,
    {
        self.book
            .lock()
            .balance_errors
            .entry(account_id.to_string())
            .or_default()
            .extend(errors);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    #[cfg(test)]
    /// Number of `place_order` calls received for `account_id`, failed ones
    /// included.
    pub fn order_calls(&self, account_id: &str) -> u64 {
        self.book.lock().order_calls.get(account_id).copied().unwrap_or(0)
    }

    #[cfg(test)]
    /// Fills executed for `account_id`, oldest first.
    pub fn fills(&self, account_id: &str) -> Vec<Fill> {
        self.book.lock().fills.get(account_id).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn holding(&self, account_id: &str, symbol: &str) -> Option<Holding> {
        self.book
            .lock()
            .holdings
            .get(&(account_id.to_string(), symbol.to_string()))
            .copied()
    }

    async fn simulate_latency(&self) {
        let latency = self.book.lock().latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }
}

/// Credential handles the paper exchange accepts.
const PAPER_CREDENTIALS_PREFIX: &str = "paper";

fn authorise(account: &Account) -> Result<(), GatewayError> {
    if account.credentials().starts_with(PAPER_CREDENTIALS_PREFIX) {
        Ok(())
    } else {
        Err(GatewayError::Permanent(format!(
            "account {} has no paper-exchange credentials",
            account.id
        )))
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn place_order(
        &self,
        account: &Account,
        symbol: &str,
        side: OrderSide,
        size: f64,
    ) -> Result<Fill, GatewayError> {
        self.simulate_latency().await;

        authorise(account)?;

        let mut book = self.book.lock();
        #[cfg(test)]
        {
            *book.order_calls.entry(account.id.clone()).or_default() += 1;
        }

        if let Some(err) = book
            .order_errors
            .get_mut(&account.id)
            .and_then(VecDeque::pop_front)
        {
            debug!(account = %account.id, symbol, error = %err, "paper order failed (scripted)");
            return Err(err);
        }

        let price = *book
            .prices
            .get(symbol)
            .ok_or_else(|| GatewayError::Permanent(format!("unknown symbol {symbol}")))?;
        if !(size > SIZE_EPSILON && size.is_finite()) {
            return Err(GatewayError::Permanent(format!("invalid quantity {size}")));
        }

        let key = (account.id.clone(), symbol.to_string());
        let effect = Holding::apply(book.holdings.get(&key).copied(), side, size, price);
        match effect.holding {
            Some(h) => {
                book.holdings.insert(key, h);
            }
            None => {
                book.holdings.remove(&key);
            }
        }

        let starting = self.starting_balance;
        *book.balances.entry(account.id.clone()).or_insert(starting) += effect.realized_pnl;

        let fill = Fill {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            size,
            price,
            timestamp: Utc::now(),
        };
        #[cfg(test)]
        book.fills
            .entry(account.id.clone())
            .or_default()
            .push(fill.clone());

        debug!(
            account = %account.id,
            symbol,
            side = %side,
            size,
            price,
            realized_pnl = effect.realized_pnl,
            "paper fill"
        );
        Ok(fill)
    }

    async fn get_position(
        &self,
        account: &Account,
        symbol: &str,
    ) -> Result<Option<PositionState>, GatewayError> {
        self.simulate_latency().await;
        authorise(account)?;

        let book = self.book.lock();
        let Some(h) = book.holdings.get(&(account.id.clone(), symbol.to_string())) else {
            return Ok(None);
        };
        let mark_price = book.prices.get(symbol).copied().unwrap_or(h.entry_price);
        Ok(Some(PositionState {
            symbol: symbol.to_string(),
            side: h.side,
            size: h.size,
            entry_price: h.entry_price,
            mark_price,
        }))
    }

    async fn get_price(&self, account: &Account, symbol: &str) -> Result<f64, GatewayError> {
        self.simulate_latency().await;
        authorise(account)?;

        self.book
            .lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Permanent(format!("unknown symbol {symbol}")))
    }

    async fn get_balance(&self, account: &Account) -> Result<f64, GatewayError> {
        self.simulate_latency().await;
        authorise(account)?;

        let mut book = self.book.lock();
        if let Some(err) = book
            .balance_errors
            .get_mut(&account.id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let starting = self.starting_balance;
        Ok(*book.balances.entry(account.id.clone()).or_insert(starting))
    }
}

impl std::fmt::Debug for PaperGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let book = self.book.lock();
        f.debug_struct("PaperGateway")
            .field("starting_balance", &self.starting_balance)
            .field("symbols", &book.prices.len())
            .field("open_holdings", &book.holdings.len())
            .finish()
    }
}
