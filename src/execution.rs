// =============================================================================
// Order Executor — every gateway call the account tasks make goes through here
// =============================================================================
//
//   * Each gateway call is bounded by `gateway_timeout`; an expired call is a
//     transient `GatewayError::Timeout`.
//   * Signal orders are retried on transient errors up to
//     `retry.max_attempts`, with exponential backoff. A timed-out order is
//     only resent once a position re-read shows it did not fill. Permanent
//     errors and exhausted retries are written to the ledger as failed
//     orders.
//   * Close orders (trailing stop, balance breach, close signal) retry without limit and
//     raise an alert every `alert_every_attempts` consecutive failures. Before
//     every attempt the exchange position is re-read so a close that filled
//     late, or was closed elsewhere, is not sent twice.
//   * Fills are appended to the ledger; a ledger failure halts the account.
//
// The executor is shared by all account tasks; all per-account state lives in
// the tasks themselves.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::alerts::{AlertKind, AlertLog};
use crate::backoff::ExponentialBackoff;
use crate::config::{ExecutorConfig, RetrySettings};
use crate::error::{DispatchError, GatewayError, LedgerError};
use crate::gateway::{ExchangeGateway, Fill, PositionState};
use crate::ledger::{Execution, FailedOrder, TradeLedger};
use crate::position::{Holding, SIZE_EPSILON};
use crate::registry::{Account, AccountRegistry};
use crate::types::{ExecutionCause, OrderSide};

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Outcome of the unbounded close sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseResult {
    /// The close order filled.
    Filled { fill: Fill, attempts: u32 },
    /// The exchange reports no position left to close.
    AlreadyFlat { attempts: u32 },
    /// Shutdown was requested while retrying.
    Abandoned { attempts: u32 },
}

impl std::fmt::Display for CloseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled { fill, attempts } => {
                write!(f, "Filled({} @ {} after {attempts})", fill.size, fill.price)
            }
            Self::AlreadyFlat { attempts } => write!(f, "AlreadyFlat(after {attempts})"),
            Self::Abandoned { attempts } => write!(f, "Abandoned(after {attempts})"),
        }
    }
}

/// What a re-read tells about an order whose placement timed out.
#[derive(Debug)]
enum TimedOutOrder {
    Filled(Fill),
    NotFilled,
    Unknown,
}

fn signed_size(state: Option<&PositionState>) -> f64 {
    state.map_or(0.0, |s| s.side.direction() * s.size)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct OrderExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<TradeLedger>,
    registry: Arc<AccountRegistry>,
    alerts: Arc<AlertLog>,
    retry: RetrySettings,
    alert_every: u32,
    timeout: Duration,
}

impl OrderExecutor {
    pub fn new(
        config: &ExecutorConfig,
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<TradeLedger>,
        registry: Arc<AccountRegistry>,
        alerts: Arc<AlertLog>,
    ) -> Self {
        Self {
            gateway,
            ledger,
            registry,
            alerts,
            retry: config.retry.clone(),
            alert_every: config.monitor.alert_every_attempts.max(1),
            timeout: config.gateway_timeout(),
        }
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    /// Consecutive failures between two alerts.
    pub fn alert_every(&self) -> u32 {
        self.alert_every
    }

    // -------------------------------------------------------------------------
    // Gateway reads
    // -------------------------------------------------------------------------

    /// Single balance read, bounded by the gateway timeout.
    pub async fn poll_balance(&self, account: &Account) -> Result<f64, GatewayError> {
        self.guarded(self.gateway.get_balance(account)).await
    }

    /// Single price read, bounded by the gateway timeout.
    pub async fn poll_price(&self, account: &Account, symbol: &str) -> Result<f64, GatewayError> {
        self.guarded(self.gateway.get_price(account, symbol)).await
    }

    /// Single position read, bounded by the gateway timeout.
    pub async fn poll_position(
        &self,
        account: &Account,
        symbol: &str,
    ) -> Result<Option<PositionState>, GatewayError> {
        self.guarded(self.gateway.get_position(account, symbol)).await
    }

    /// Balance read with the signal retry policy.
    #[instrument(skip(self, account), fields(account = %account.id), name = "executor::fetch_balance")]
    pub async fn fetch_balance(&self, account: &Account) -> Result<f64, DispatchError> {
        let gateway = self.gateway.as_ref();
        self.with_retry(&account.id, "get_balance", move || gateway.get_balance(account))
            .await
    }

    /// Price read with the signal retry policy.
    #[instrument(skip(self, account), fields(account = %account.id), name = "executor::fetch_price")]
    pub async fn fetch_price(&self, account: &Account, symbol: &str) -> Result<f64, DispatchError> {
        let gateway = self.gateway.as_ref();
        self.with_retry(&account.id, "get_price", move || gateway.get_price(account, symbol))
            .await
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Place a signal order, retrying transient failures. A final failure is
    /// recorded in the ledger as a failed order.
    ///
    /// A timed-out call may still have filled on the exchange, so before it
    /// is retried the position is re-read and compared with the position
    /// taken before the first attempt. A matching change is taken as the
    /// fill; when the outcome cannot be established the order is not sent
    /// again.
    #[instrument(skip(self, account), fields(account = %account.id), name = "executor::place")]
    pub async fn place(
        &self,
        account: &Account,
        symbol: &str,
        side: OrderSide,
        size: f64,
        cause: ExecutionCause,
    ) -> Result<Fill, DispatchError> {
        debug!(account = %account.id, symbol, side = %side, size, %cause, "placing order");

        let before = match self.poll_position(account, symbol).await {
            Ok(state) => Some(signed_size(state.as_ref())),
            Err(err) => {
                debug!(account = %account.id, symbol, error = %err, "pre-order position read failed");
                None
            }
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::for_orders(&self.retry);
        let mut attempts: u32 = 0;

        let result = loop {
            attempts += 1;
            let err = match self
                .guarded(self.gateway.place_order(account, symbol, side, size))
                .await
            {
                Ok(fill) => break Ok(fill),
                Err(err) => err,
            };

            let timed_out = matches!(err, GatewayError::Timeout(_));
            if !err.is_transient() || (!timed_out && attempts >= max_attempts) {
                break Err(DispatchError::Gateway { attempts, source: err });
            }

            let delay = backoff.next_delay();
            tokio::time::sleep(delay).await;

            if timed_out {
                match self.settle_timed_out(account, symbol, side, size, before).await {
                    TimedOutOrder::Filled(fill) => break Ok(fill),
                    TimedOutOrder::NotFilled => {}
                    TimedOutOrder::Unknown => {
                        warn!(
                            account = %account.id,
                            symbol,
                            attempts,
                            "timed-out order could not be confirmed — not resending"
                        );
                        break Err(DispatchError::Gateway { attempts, source: err });
                    }
                }
            }

            if attempts >= max_attempts {
                break Err(DispatchError::Gateway { attempts, source: err });
            }
            debug!(
                account = %account.id,
                op = "place_order",
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient gateway error — retrying"
            );
        };

        if let Err(DispatchError::Gateway { attempts, source }) = &result {
            warn!(
                account = %account.id,
                symbol,
                side = %side,
                size,
                attempts,
                error = %source,
                "order failed"
            );
            let failure = FailedOrder {
                account_id: account.id.clone(),
                symbol: symbol.to_string(),
                side,
                size,
                reason: source.to_string(),
                attempts: *attempts,
                cause,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.ledger.record_failure(failure) {
                self.storage_failed(&account.id, &e);
            }
        }
        result
    }

    /// Decide whether a timed-out order filled by comparing the exchange
    /// position with the one read before the first attempt.
    async fn settle_timed_out(
        &self,
        account: &Account,
        symbol: &str,
        side: OrderSide,
        size: f64,
        before: Option<f64>,
    ) -> TimedOutOrder {
        let Some(before) = before else {
            return TimedOutOrder::Unknown;
        };
        let state = match self.poll_position(account, symbol).await {
            Ok(state) => state,
            Err(err) => {
                debug!(account = %account.id, symbol, error = %err, "post-timeout position read failed");
                return TimedOutOrder::Unknown;
            }
        };

        let after = signed_size(state.as_ref());
        if (after - before).abs() <= SIZE_EPSILON {
            return TimedOutOrder::NotFilled;
        }
        let expected = before + side.sign() * size;
        if (after - expected).abs() > SIZE_EPSILON {
            warn!(
                account = %account.id,
                symbol,
                before,
                after,
                expected,
                "position moved by something other than the timed-out order"
            );
            return TimedOutOrder::Unknown;
        }

        let price = match &state {
            Some(s) => s.mark_price,
            None => match self.poll_price(account, symbol).await {
                Ok(price) => price,
                Err(_) => return TimedOutOrder::Unknown,
            },
        };
        info!(
            account = %account.id,
            symbol,
            side = %side,
            size,
            price,
            "timed-out order found filled on the exchange"
        );
        TimedOutOrder::Filled(Fill {
            order_id: format!("confirmed-{}", Uuid::new_v4()),
            symbol: symbol.to_string(),
            side,
            size,
            price,
            timestamp: Utc::now(),
        })
    }

    /// Close `holding` in `symbol`, retrying until it fills, the exchange
    /// reports the position gone, or shutdown is requested.
    #[instrument(skip(self, account, holding, shutdown), fields(account = %account.id), name = "executor::close")]
    pub async fn close(
        &self,
        account: &Account,
        symbol: &str,
        holding: Holding,
        cause: ExecutionCause,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CloseResult {
        let side = holding.side.closing_order();
        let mut size = holding.size;
        let mut backoff = ExponentialBackoff::for_closes(&self.retry);
        let mut attempts: u32 = 0;

        info!(
            account = %account.id,
            symbol,
            side = %side,
            size,
            %cause,
            "closing position"
        );

        loop {
            match self.poll_position(account, symbol).await {
                Ok(Some(state)) if state.side == holding.side => {
                    if (state.size - size).abs() > SIZE_EPSILON {
                        debug!(
                            account = %account.id,
                            symbol,
                            from = size,
                            to = state.size,
                            "close size follows exchange position"
                        );
                    }
                    size = state.size;
                }
                Ok(_) => {
                    info!(account = %account.id, symbol, attempts, "exchange reports position already closed");
                    return CloseResult::AlreadyFlat { attempts };
                }
                Err(err) => {
                    debug!(account = %account.id, symbol, error = %err, "position re-read failed");
                }
            }

            attempts += 1;
            match self
                .guarded(self.gateway.place_order(account, symbol, side, size))
                .await
            {
                Ok(fill) => {
                    info!(
                        account = %account.id,
                        symbol,
                        price = fill.price,
                        size = fill.size,
                        attempts,
                        %cause,
                        "position closed"
                    );
                    return CloseResult::Filled { fill, attempts };
                }
                Err(err) => {
                    warn!(
                        account = %account.id,
                        symbol,
                        attempts,
                        error = %err,
                        "close order failed — retrying"
                    );
                    if attempts % self.alert_every == 0 {
                        self.alerts.raise(
                            &account.id,
                            AlertKind::CloseRetrying,
                            Some(symbol),
                            attempts,
                            format!("{cause} close of {size} {symbol} still failing: {err}"),
                        );
                    }
                }
            }

            if *shutdown.borrow() {
                warn!(account = %account.id, symbol, attempts, "close abandoned on shutdown");
                return CloseResult::Abandoned { attempts };
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    warn!(account = %account.id, symbol, attempts, "close abandoned on shutdown");
                    return CloseResult::Abandoned { attempts };
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Ledger
    // -------------------------------------------------------------------------

    /// Append `fill` to the ledger. On failure the account is halted and an
    /// alert raised; the caller still owns the position change.
    pub fn record(
        &self,
        account_id: &str,
        fill: &Fill,
        cause: ExecutionCause,
    ) -> Result<Execution, LedgerError> {
        let execution = Execution::from_fill(account_id, fill, cause);
        match self.ledger.append(execution) {
            Ok(stored) => {
                debug!(account = %account_id, id = %stored.id, symbol = %stored.symbol, "execution recorded");
                Ok(stored)
            }
            Err(e) => {
                error!(
                    account = %account_id,
                    order_id = %fill.order_id,
                    symbol = %fill.symbol,
                    side = %fill.side,
                    size = fill.size,
                    price = fill.price,
                    %cause,
                    "UNRECORDED FILL"
                );
                self.storage_failed(account_id, &e);
                Err(e)
            }
        }
    }

    fn storage_failed(&self, account_id: &str, err: &LedgerError) {
        self.registry.halt(account_id, err.to_string());
        self.alerts
            .raise(account_id, AlertKind::StorageFailure, None, 1, err.to_string());
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn guarded<T, F>(&self, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        account_id: &str,
        op: &str,
        mut call: F,
    ) -> Result<T, DispatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::for_orders(&self.retry);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.guarded(call()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempts < max_attempts => {
                    let delay = backoff.next_delay();
                    debug!(
                        account = %account_id,
                        op,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient gateway error — retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => return Err(DispatchError::Gateway { attempts, source }),
            }
        }
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("gateway", &"<ExchangeGateway>")
            .field("ledger", &self.ledger)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}
