// =============================================================================
// Position Monitor — per-account position book and periodic supervision
// =============================================================================
//
// Owned by exactly one account task, so no locking: fills from signals and
// monitor ticks are applied by the same task in the order they happen.
//
// Each tick:
//   1. Read the balance once. Below `min_balance_threshold` every open
//      position is flattened (cause: balance-breach), an alert is raised and,
//      when `disable_on_breach` is set, the account stops taking signals.
//   2. For every open position read the exchange position, warn on drift
//      between book and exchange, feed the mark price to the trailing stop
//      and close the position when the stop is crossed.
//   3. Positions left in Closing (shutdown mid-close) are closed again.
//
// Explicit close signals use the same close path as stops and breaches.
//
// Failed reads skip that position for this tick; every `alert_every_attempts`
// consecutive failures raise a monitor-degraded alert.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::AlertKind;
use crate::config::MonitorSettings;
use crate::error::{GatewayError, LedgerError};
use crate::execution::{CloseResult, OrderExecutor};
use crate::gateway::{Fill, PositionState};
use crate::ledger::Execution;
use crate::position::{FillKind, Holding, Position, PositionPhase, SIZE_EPSILON};
use crate::registry::Account;
use crate::types::ExecutionCause;

/// Counters published with every account snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub ticks: u64,
    /// Times a trailing stop ratcheted.
    pub stop_adjustments: u64,
    pub stops_triggered: u64,
    pub breaches: u64,
    pub drift_warnings: u64,
    pub consecutive_failures: u32,
    pub last_balance: Option<f64>,
    pub last_tick: Option<DateTime<Utc>>,
}

/// How a close requested through the monitor ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// The close is in the ledger (a fill, or a reconciling record when the
    /// exchange was already flat).
    Recorded(Execution),
    /// The position left the book but its execution could not be stored.
    Unrecorded(LedgerError),
    /// Shutdown interrupted the retries; the position stays Closing.
    Abandoned { attempts: u32 },
    /// No position in that symbol.
    NotOpen,
}

pub struct PositionMonitor {
    account: Arc<Account>,
    settings: MonitorSettings,
    positions: BTreeMap<String, Position>,
    stats: MonitorStats,
    in_breach: bool,
}

impl PositionMonitor {
    pub fn new(account: Arc<Account>, settings: MonitorSettings) -> Self {
        Self {
            account,
            settings,
            positions: BTreeMap::new(),
            stats: MonitorStats::default(),
            in_breach: false,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Current holding in `symbol` according to the book.
    pub fn holding(&self, symbol: &str) -> Option<Holding> {
        self.positions
            .get(symbol)
            .filter(|p| p.size > SIZE_EPSILON)
            .map(Position::holding)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    // -------------------------------------------------------------------------
    // Book updates
    // -------------------------------------------------------------------------

    /// Apply a confirmed fill to the book.
    pub fn apply_fill(&mut self, fill: &Fill) -> FillKind {
        let current = self.positions.get(&fill.symbol).map(Position::holding);
        let effect = Holding::apply(current, fill.side, fill.size, fill.price);

        match (effect.kind, effect.holding) {
            (FillKind::Opened, Some(h)) | (FillKind::Flipped, Some(h)) => {
                let pos = Position::open(
                    &self.account.id,
                    &fill.symbol,
                    h,
                    self.account.risk.trailing_stop_pct,
                    fill.timestamp,
                );
                info!(
                    account = %self.account.id,
                    id = %pos.id,
                    symbol = %pos.symbol,
                    side = %pos.side,
                    size = pos.size,
                    entry = pos.entry_price,
                    stop = pos.stop_price,
                    flipped = effect.kind == FillKind::Flipped,
                    "position opened"
                );
                self.positions.insert(fill.symbol.clone(), pos);
            }
            (FillKind::Increased, Some(h)) | (FillKind::Reduced, Some(h)) => {
                if let Some(pos) = self.positions.get_mut(&fill.symbol) {
                    pos.resize(h);
                    debug!(
                        account = %self.account.id,
                        symbol = %fill.symbol,
                        size = pos.size,
                        entry = pos.entry_price,
                        "position resized"
                    );
                }
            }
            _ => {
                if let Some(mut pos) = self.positions.remove(&fill.symbol) {
                    pos.mark_closed();
                    info!(
                        account = %self.account.id,
                        id = %pos.id,
                        symbol = %pos.symbol,
                        exit = fill.price,
                        realized_pnl = effect.realized_pnl,
                        "position closed"
                    );
                }
            }
        }
        effect.kind
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    pub async fn tick(&mut self, exec: &OrderExecutor, shutdown: &mut watch::Receiver<bool>) {
        self.stats.ticks += 1;
        self.stats.last_tick = Some(Utc::now());
        let mut failed = false;

        // ── 1. Balance floor ─────────────────────────────────────────
        match exec.poll_balance(&self.account).await {
            Ok(balance) => {
                self.stats.last_balance = Some(balance);
                if balance < self.account.risk.min_balance_threshold {
                    self.stats.consecutive_failures = 0;
                    self.on_breach(balance, exec, shutdown).await;
                    return;
                }
                if self.in_breach {
                    info!(account = %self.account.id, balance, "balance back above floor");
                    self.in_breach = false;
                }
            }
            Err(err) => {
                failed = true;
                self.note_failure(exec, None, &err);
            }
        }

        if self.positions.is_empty() {
            debug!(account = %self.account.id, "monitor: no open positions");
            if !failed {
                self.stats.consecutive_failures = 0;
            }
            return;
        }

        // ── 2. Trailing stops ────────────────────────────────────────
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        for symbol in symbols {
            if *shutdown.borrow() {
                return;
            }
            let Some(phase) = self.positions.get(&symbol).map(|p| p.phase) else {
                continue;
            };
            if phase == PositionPhase::Closing {
                self.close_symbol(&symbol, ExecutionCause::TrailingStop, exec, shutdown)
                    .await;
                continue;
            }

            let price = match exec.poll_position(&self.account, &symbol).await {
                Ok(Some(state)) => {
                    self.check_drift(&symbol, Some(&state));
                    state.mark_price
                }
                Ok(None) => {
                    self.check_drift(&symbol, None);
                    match exec.poll_price(&self.account, &symbol).await {
                        Ok(price) => price,
                        Err(err) => {
                            failed = true;
                            self.note_failure(exec, Some(&symbol), &err);
                            continue;
                        }
                    }
                }
                Err(err) => {
                    failed = true;
                    self.note_failure(exec, Some(&symbol), &err);
                    continue;
                }
            };

            let Some(pos) = self.positions.get_mut(&symbol) else {
                continue;
            };
            let outcome = pos.mark(price);
            if outcome.stop_moved {
                self.stats.stop_adjustments += 1;
            }
            if outcome.triggered {
                self.stats.stops_triggered += 1;
                info!(
                    account = %self.account.id,
                    id = %pos.id,
                    symbol = %pos.symbol,
                    side = %pos.side,
                    entry_price = pos.entry_price,
                    price,
                    stop = pos.stop_price,
                    high_water_mark = pos.high_water_mark,
                    "TRAILING STOP TRIGGERED — closing position"
                );
                self.close_symbol(&symbol, ExecutionCause::TrailingStop, exec, shutdown)
                    .await;
            }
        }

        if !failed {
            self.stats.consecutive_failures = 0;
        }
    }

    async fn on_breach(
        &mut self,
        balance: f64,
        exec: &OrderExecutor,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let floor = self.account.risk.min_balance_threshold;
        if !self.in_breach {
            self.in_breach = true;
            self.stats.breaches += 1;
            exec.alerts().raise(
                &self.account.id,
                AlertKind::BalanceBreach,
                None,
                0,
                format!(
                    "balance {balance:.2} below floor {floor:.2}; flattening {} position(s)",
                    self.positions.len()
                ),
            );
            if self.settings.disable_on_breach {
                exec.registry().set_enabled(&self.account.id, false);
            }
        }

        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        for symbol in symbols {
            if *shutdown.borrow() {
                return;
            }
            self.close_symbol(&symbol, ExecutionCause::BalanceBreach, exec, shutdown)
                .await;
        }
    }

    async fn close_symbol(
        &mut self,
        symbol: &str,
        cause: ExecutionCause,
        exec: &OrderExecutor,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        if let CloseOutcome::Abandoned { attempts } =
            self.close_position(symbol, cause, exec, shutdown).await
        {
            warn!(account = %self.account.id, symbol, attempts, "position left closing");
        }
    }

    /// Move the position in `symbol` to Closing and close it, retrying until
    /// the exchange confirms or shutdown is requested.
    ///
    /// When the exchange turns out to be flat already, a reconciling close at
    /// the last observed price is recorded so that the ledger and the book
    /// stay in step.
    pub async fn close_position(
        &mut self,
        symbol: &str,
        cause: ExecutionCause,
        exec: &OrderExecutor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CloseOutcome {
        let Some(pos) = self.positions.get_mut(symbol) else {
            return CloseOutcome::NotOpen;
        };
        pos.begin_closing();
        let holding = pos.holding();
        let last_price = pos.last_price;

        match exec
            .close(&self.account, symbol, holding, cause, shutdown)
            .await
        {
            CloseResult::Filled { fill, .. } => self.settle_close(&fill, cause, exec),
            CloseResult::AlreadyFlat { .. } => {
                let fill = Fill {
                    order_id: format!("reconciled-{}", Uuid::new_v4()),
                    symbol: symbol.to_string(),
                    side: holding.side.closing_order(),
                    size: holding.size,
                    price: last_price,
                    timestamp: Utc::now(),
                };
                warn!(
                    account = %self.account.id,
                    symbol,
                    size = holding.size,
                    price = last_price,
                    %cause,
                    "exchange already flat — recording reconciling close at last price"
                );
                self.settle_close(&fill, cause, exec)
            }
            CloseResult::Abandoned { attempts } => CloseOutcome::Abandoned { attempts },
        }
    }

    fn settle_close(&mut self, fill: &Fill, cause: ExecutionCause, exec: &OrderExecutor) -> CloseOutcome {
        let recorded = exec.record(&self.account.id, fill, cause);
        if self.apply_fill(fill) != FillKind::Closed {
            warn!(
                account = %self.account.id,
                symbol = %fill.symbol,
                "close fill left a residual in the book — dropping it, exchange is flat"
            );
            self.positions.remove(&fill.symbol);
        }

        match recorded {
            Ok(execution) => CloseOutcome::Recorded(execution),
            Err(err) => {
                warn!(
                    account = %self.account.id,
                    symbol = %fill.symbol,
                    error = %err,
                    "close applied to the book without a ledger record"
                );
                CloseOutcome::Unrecorded(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn check_drift(&mut self, symbol: &str, state: Option<&PositionState>) {
        let Some(pos) = self.positions.get(symbol) else {
            return;
        };
        let drifted = match state {
            None => true,
            Some(s) => s.side != pos.side || (s.size - pos.size).abs() > SIZE_EPSILON,
        };
        if drifted {
            self.stats.drift_warnings += 1;
            warn!(
                account = %self.account.id,
                symbol,
                book_side = %pos.side,
                book_size = pos.size,
                exchange_side = ?state.map(|s| s.side),
                exchange_size = state.map(|s| s.size).unwrap_or(0.0),
                "position drift between book and exchange — keeping book"
            );
        }
    }

    fn note_failure(&mut self, exec: &OrderExecutor, symbol: Option<&str>, err: &GatewayError) {
        self.stats.consecutive_failures += 1;
        let failures = self.stats.consecutive_failures;
        warn!(
            account = %self.account.id,
            symbol = ?symbol,
            failures,
            error = %err,
            "monitor read failed"
        );
        if failures % exec.alert_every() == 0 {
            exec.alerts().raise(
                &self.account.id,
                AlertKind::MonitorDegraded,
                symbol,
                failures,
                format!("{failures} consecutive monitor failures: {err}"),
            );
        }
    }
}

impl std::fmt::Debug for PositionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionMonitor")
            .field("account", &self.account.id)
            .field("positions", &self.positions.len())
            .field("stats", &self.stats)
            .finish()
    }
}
