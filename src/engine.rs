// =============================================================================
// Engine — wires registry, gateway, ledger and account tasks together
// =============================================================================
//
// Startup:
//   1. Build the account registry from the configuration.
//   2. Open the ledger (JSON-lines file when `ledger_path` is set).
//   3. Spawn one worker per account, each with its own bounded queue.
//
// Queries (positions, stats, status) read shared snapshots and the ledger;
// they never wait on an account task.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alerts::{Alert, AlertLog};
use crate::config::ExecutorConfig;
use crate::dispatcher::{AccountOutcome, Dispatch, Dispatcher};
use crate::execution::OrderExecutor;
use crate::gateway::ExchangeGateway;
use crate::ledger::{FailedOrder, LedgerStats, StatsWindow, TradeLedger};
use crate::monitor::MonitorStats;
use crate::position::{Position, SIZE_EPSILON};
use crate::registry::AccountRegistry;
use crate::types::Signal;
use crate::worker::{new_snapshot_board, AccountWorker, SignalCounters, SnapshotBoard};

/// Alerts included in an account status.
const STATUS_ALERTS: usize = 5;

/// Operator view of one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub id: String,
    pub enabled: bool,
    /// Set while new signals are refused after a ledger failure.
    pub halted: Option<String>,
    pub open_positions: usize,
    pub executions: usize,
    pub failed_orders: usize,
    pub signals: SignalCounters,
    pub monitor: MonitorStats,
    /// Replaying the ledger reproduces the open positions.
    pub ledger_consistent: bool,
    pub recent_alerts: Vec<Alert>,
}

pub struct Engine {
    registry: Arc<AccountRegistry>,
    ledger: Arc<TradeLedger>,
    alerts: Arc<AlertLog>,
    board: SnapshotBoard,
    dispatcher: Dispatcher,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Validate `config`, open the configured ledger and start every account
    /// task. Must be called from within a Tokio runtime.
    pub fn start(config: &ExecutorConfig, gateway: Arc<dyn ExchangeGateway>) -> Result<Self> {
        config.validate().context("invalid executor config")?;
        let ledger = match &config.ledger_path {
            Some(path) => TradeLedger::open(path)
                .with_context(|| format!("failed to open ledger at {}", path.display()))?,
            None => TradeLedger::in_memory(),
        };
        Ok(Self::start_with_ledger(config, gateway, ledger))
    }

    /// Start every account task against an already constructed ledger.
    pub fn start_with_ledger(
        config: &ExecutorConfig,
        gateway: Arc<dyn ExchangeGateway>,
        ledger: TradeLedger,
    ) -> Self {
        let registry = Arc::new(AccountRegistry::from_config(&config.accounts));
        let ledger = Arc::new(ledger);
        let alerts = Arc::new(AlertLog::new());
        let board = new_snapshot_board();
        let executor = Arc::new(OrderExecutor::new(
            config,
            gateway,
            ledger.clone(),
            registry.clone(),
            alerts.clone(),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut dispatcher = Dispatcher::new(registry.clone());
        let mut workers = Vec::with_capacity(registry.len());

        for id in registry.ids() {
            let Some(account) = registry.get(id) else {
                continue;
            };
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            dispatcher.attach(id, tx);
            let worker = AccountWorker::new(
                account,
                executor.clone(),
                config.monitor.clone(),
                board.clone(),
            );
            workers.push(worker.spawn(rx, shutdown_rx.clone()));
        }

        info!(
            accounts = registry.len(),
            queue_capacity = config.queue_capacity,
            monitor_interval_ms = config.monitor.interval_ms,
            "engine started"
        );

        Self {
            registry,
            ledger,
            alerts,
            board,
            dispatcher,
            shutdown,
            workers,
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Submit a signal and wait for every targeted account's outcome.
    pub async fn submit(&self, signal: Signal) -> Vec<AccountOutcome> {
        self.dispatcher.submit(signal).await
    }

    /// Queue a signal to its accounts without waiting for them.
    pub async fn enqueue(&self, signal: Signal) -> Dispatch {
        self.dispatcher.enqueue(signal).await
    }

    /// Operator pause/resume. Returns `false` for an unknown account.
    pub fn set_enabled(&self, account_id: &str, enabled: bool) -> bool {
        self.registry.set_enabled(account_id, enabled)
    }

    /// Clear a ledger-failure halt. Returns `false` for an unknown account.
    pub fn resume(&self, account_id: &str) -> bool {
        self.registry.resume(account_id)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Open positions of one account, or of every account when `None`.
    pub fn list_positions(&self, account_id: Option<&str>) -> Vec<Position> {
        let board = self.board.read();
        match account_id {
            Some(id) => board
                .get(id)
                .map(|s| s.positions.clone())
                .unwrap_or_default(),
            None => self
                .registry
                .ids()
                .iter()
                .filter_map(|id| board.get(id))
                .flat_map(|s| s.positions.iter().cloned())
                .collect(),
        }
    }

    /// Ledger statistics; `None` for an unknown account.
    pub fn get_stats(&self, account_id: &str, window: StatsWindow) -> Option<LedgerStats> {
        self.registry.get(account_id)?;
        Some(self.ledger.query_stats(account_id, window))
    }

    pub fn failures(&self, account_id: &str) -> Vec<FailedOrder> {
        self.ledger.failures(account_id)
    }

    pub fn alerts(&self, account_id: &str, count: usize) -> Vec<Alert> {
        self.alerts.for_account(account_id, count)
    }

    pub fn status(&self, account_id: &str) -> Option<AccountStatus> {
        let account = self.registry.get(account_id)?;
        let snapshot = self.board.read().get(account_id).cloned().unwrap_or_default();
        let ledger_consistent = self.ledger_matches_book(account_id, &snapshot.positions);
        Some(AccountStatus {
            id: account.id.clone(),
            enabled: account.is_enabled(),
            halted: account.halt_reason(),
            open_positions: snapshot.positions.len(),
            executions: self.ledger.execution_count(account_id),
            failed_orders: self.ledger.failures(account_id).len(),
            signals: snapshot.signals,
            monitor: snapshot.monitor,
            ledger_consistent,
            recent_alerts: self.alerts.for_account(account_id, STATUS_ALERTS),
        })
    }

    /// Status of every account in configuration order.
    pub fn accounts(&self) -> Vec<AccountStatus> {
        self.registry
            .ids()
            .iter()
            .filter_map(|id| self.status(id))
            .collect()
    }

    /// Compare the ledger replay of `account_id` with its live book.
    fn ledger_matches_book(&self, account_id: &str, positions: &[Position]) -> bool {
        let replayed = self.ledger.replay_positions(account_id);
        let consistent = replayed.len() == positions.len()
            && positions.iter().all(|pos| {
                replayed.get(&pos.symbol).is_some_and(|h| {
                    h.side == pos.side && (h.size - pos.size).abs() <= SIZE_EPSILON
                })
            });
        if !consistent {
            warn!(
                account = %account_id,
                replayed = replayed.len(),
                live = positions.len(),
                "ledger replay does not match the live book"
            );
        }
        consistent
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Stop every account task and wait for them to exit. In-flight close
    /// retries are abandoned; queued signals are answered as unavailable.
    pub async fn shutdown(mut self) {
        info!(workers = self.workers.len(), "engine shutting down");
        let _ = self.shutdown.send(true);
        self.dispatcher.close();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "account worker panicked");
            }
        }
        info!("engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("ledger", &self.ledger)
            .field("dispatcher", &self.dispatcher)
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use futures_util::future::join_all;
    use futures_util::{FutureExt, StreamExt};

    use crate::alerts::AlertKind;
    use crate::config::{AccountConfig, RetrySettings, RiskParams};
    use crate::dispatcher::Outcome;
    use crate::error::{DispatchError, GatewayError, LedgerError, RiskRejection};
    use crate::gateway::paper::PaperGateway;
    use crate::ledger::{LedgerRecord, LedgerSink};
    use crate::types::{ExecutionCause, OrderSide, SignalSide, SignalSize};

    fn account(id: &str, max_position_size: f64) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            credentials: "paper".to_string(),
            enabled: true,
            risk: RiskParams {
                max_position_size,
                max_leverage: 5.0,
                min_balance_threshold: 100.0,
                trailing_stop_pct: 5.0,
            },
        }
    }

    fn config(accounts: Vec<AccountConfig>) -> ExecutorConfig {
        let mut cfg = ExecutorConfig::default();
        cfg.accounts = accounts;
        cfg.ledger_path = None;
        cfg.monitor.interval_ms = 3_600_000;
        cfg.monitor.alert_every_attempts = 2;
        cfg.gateway_timeout_ms = 1_000;
        cfg.retry = RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            close_max_delay_ms: 5,
            jitter: 0.0,
        };
        cfg
    }

    fn paper() -> Arc<PaperGateway> {
        let gw = Arc::new(PaperGateway::new(10_000.0));
        gw.set_price("BTCUSDT", 1.0);
        gw.set_price("ETHUSDT", 1.0);
        gw
    }

    fn units(side: SignalSide, size: f64) -> Signal {
        Signal::new("BTCUSDT", side, SignalSize::Units(size))
    }

    fn outcome_for<'a>(outcomes: &'a [AccountOutcome], id: &str) -> &'a Outcome {
        &outcomes
            .iter()
            .find(|o| o.account_id == id)
            .unwrap()
            .outcome
    }

    #[tokio::test]
    async fn signal_fans_out_and_each_account_applies_its_own_limits() {
        let gw = paper();
        let engine = Engine::start(
            &config(vec![account("small", 2.0), account("large", 10.0)]),
            gw.clone(),
        )
        .unwrap();

        let outcomes = engine.submit(units(SignalSide::Long, 5.0)).await;
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcome_for(&outcomes, "small"),
            Outcome::Rejected(RiskRejection::ExceedsMaxPositionSize { .. })
        ));
        assert!(outcome_for(&outcomes, "large").is_executed());
        assert_eq!(gw.order_calls("small"), 0);
        assert_eq!(gw.order_calls("large"), 1);

        let positions = engine.list_positions(Some("large"));
        assert_eq!(positions.len(), 1);
        assert!((positions[0].size - 5.0).abs() < 1e-9);
        assert!(engine.list_positions(Some("small")).is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn existing_exposure_counts_against_the_limit() {
        let engine = Engine::start(&config(vec![account("a", 10.0)]), paper()).unwrap();

        assert!(engine.submit(units(SignalSide::Long, 8.0)).await[0]
            .outcome
            .is_executed());
        let over = engine.submit(units(SignalSide::Long, 3.0)).await;
        assert!(matches!(
            over[0].outcome,
            Outcome::Rejected(RiskRejection::ExceedsMaxPositionSize { .. })
        ));
        let at_limit = engine.submit(units(SignalSide::Long, 2.0)).await;
        assert!(at_limit[0].outcome.is_executed());
        assert!((engine.list_positions(Some("a"))[0].size - 10.0).abs() < 1e-9);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn signals_for_one_account_execute_in_submission_order() {
        let engine = Engine::start(&config(vec![account("a", 100.0)]), paper()).unwrap();

        let sizes = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let outcomes = join_all(
            sizes
                .iter()
                .map(|s| engine.submit(units(SignalSide::Long, *s))),
        )
        .await;
        assert!(outcomes.iter().all(|o| o[0].outcome.is_executed()));

        let recorded: Vec<f64> = engine.ledger().executions("a").iter().map(|e| e.size).collect();
        assert_eq!(recorded, sizes.to_vec());
        let executions = engine.ledger().executions("a");
        assert!(executions
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn accounts_execute_concurrently() {
        let gw = paper();
        gw.set_latency(Some(Duration::from_millis(100)));
        let accounts = (0..4).map(|i| account(&format!("acct{i}"), 10.0)).collect();
        let engine = Engine::start(&config(accounts), gw.clone()).unwrap();

        let started = Instant::now();
        let outcomes = engine.submit(units(SignalSide::Long, 1.0)).await;
        let elapsed = started.elapsed();

        assert!(outcomes.iter().all(|o| o.outcome.is_executed()));
        // balance, price, position and order: 4 calls per account; serial
        // would be 1.6s.
        assert!(elapsed < Duration::from_millis(900), "took {elapsed:?}");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn failing_account_does_not_block_the_others() {
        let gw = paper();
        gw.fail_next_orders("bad", [GatewayError::Permanent("account suspended".into())]);
        let engine = Engine::start(
            &config(vec![account("bad", 10.0), account("good", 10.0)]),
            gw.clone(),
        )
        .unwrap();

        let outcomes = engine.submit(units(SignalSide::Short, 1.0)).await;
        assert!(matches!(
            outcome_for(&outcomes, "bad"),
            Outcome::Failed(DispatchError::Gateway { attempts: 1, .. })
        ));
        assert!(outcome_for(&outcomes, "good").is_executed());
        assert_eq!(engine.failures("bad").len(), 1);
        assert!(engine.list_positions(Some("bad")).is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_account_rejects_but_stays_monitored() {
        let mut cfg = config(vec![account("a", 10.0)]);
        cfg.monitor.interval_ms = 20;
        let gw = paper();
        gw.set_price("BTCUSDT", 100.0);
        let engine = Engine::start(&cfg, gw.clone()).unwrap();

        assert!(engine.submit(units(SignalSide::Long, 1.0)).await[0]
            .outcome
            .is_executed());
        assert!(engine.set_enabled("a", false));
        let outcome = engine.submit(units(SignalSide::Long, 1.0)).await;
        assert_eq!(
            outcome[0].outcome,
            Outcome::Rejected(RiskRejection::AccountDisabled)
        );

        // The stop still fires while disabled.
        gw.set_price("BTCUSDT", 90.0);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !engine.list_positions(Some("a")).is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.list_positions(Some("a")).is_empty());
        let last = engine.ledger().executions("a").pop().unwrap();
        assert_eq!(last.cause, ExecutionCause::TrailingStop);
        assert_eq!(last.side, OrderSide::Sell);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn ledger_failure_halts_until_resumed() {
        struct Flaky(Arc<std::sync::atomic::AtomicBool>);
        impl LedgerSink for Flaky {
            fn write(&self, _: &LedgerRecord) -> std::result::Result<(), LedgerError> {
                if self.0.load(std::sync::atomic::Ordering::SeqCst) {
                    Err(LedgerError::Storage("disk full".into()))
                } else {
                    Ok(())
                }
            }
        }

        let broken = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let engine = Engine::start_with_ledger(
            &config(vec![account("a", 10.0)]),
            paper(),
            TradeLedger::with_sink(Box::new(Flaky(broken.clone()))),
        );

        let first = engine.submit(units(SignalSide::Long, 1.0)).await;
        assert!(matches!(
            first[0].outcome,
            Outcome::Failed(DispatchError::Storage(_))
        ));
        // The fill happened, so the position is supervised.
        assert_eq!(engine.list_positions(Some("a")).len(), 1);

        let second = engine.submit(units(SignalSide::Long, 1.0)).await;
        assert!(matches!(
            second[0].outcome,
            Outcome::Rejected(RiskRejection::AccountHalted { .. })
        ));
        let status = engine.status("a").unwrap();
        assert!(status.halted.is_some());
        assert!(!status.ledger_consistent);

        broken.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(engine.resume("a"));
        let third = engine.submit(units(SignalSide::Long, 1.0)).await;
        assert!(third[0].outcome.is_executed());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn close_signal_flattens_and_stats_follow_the_ledger() {
        let gw = paper();
        gw.set_price("BTCUSDT", 100.0);
        let engine = Engine::start(&config(vec![account("a", 10.0)]), gw.clone()).unwrap();

        engine.submit(units(SignalSide::Long, 2.0)).await;
        gw.set_price("BTCUSDT", 103.0);
        let closed = engine.submit(units(SignalSide::Close, 0.0)).await;
        let execution = closed[0].outcome.execution().unwrap();
        assert_eq!(execution.side, OrderSide::Sell);
        assert!((execution.size - 2.0).abs() < 1e-9);

        let nothing = engine.submit(units(SignalSide::Close, 0.0)).await;
        assert_eq!(
            nothing[0].outcome,
            Outcome::Rejected(RiskRejection::NothingToClose)
        );

        let stats = engine.get_stats("a", StatsWindow::all()).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.wins, 1);
        assert!((stats.net_pnl - 6.0).abs() < 1e-9);
        assert!(engine.get_stats("ghost", StatsWindow::all()).is_none());
        assert!(engine.ledger().replay_positions("a").is_empty());

        let status = engine.status("a").unwrap();
        assert_eq!(status.signals.received, 3);
        assert_eq!(status.signals.executed, 2);
        assert_eq!(status.signals.rejected, 1);
        assert_eq!(status.executions, 2);
        assert_eq!(status.failed_orders, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn close_signal_retries_until_the_exchange_fills() {
        let gw = paper();
        gw.set_price("BTCUSDT", 100.0);
        let engine = Engine::start(&config(vec![account("a", 10.0)]), gw.clone()).unwrap();
        assert!(engine.submit(units(SignalSide::Long, 1.0)).await[0]
            .outcome
            .is_executed());

        // More failures than the bounded signal-order retry allows.
        gw.fail_next_orders(
            "a",
            (0..5).map(|_| GatewayError::Transient("timeout".into())),
        );
        let closed = engine.submit(units(SignalSide::Close, 0.0)).await;
        let execution = closed[0].outcome.execution().unwrap();
        assert_eq!(execution.cause, ExecutionCause::Signal);
        assert_eq!(execution.side, OrderSide::Sell);
        assert!((execution.size - 1.0).abs() < 1e-9);

        assert!(engine.list_positions(Some("a")).is_empty());
        assert!(gw.holding("a", "BTCUSDT").is_none());
        assert_eq!(gw.order_calls("a"), 7);
        let retry_alerts = engine
            .alerts("a", 20)
            .iter()
            .filter(|a| a.kind == AlertKind::CloseRetrying)
            .count();
        assert_eq!(retry_alerts, 2);
        assert!(engine.failures("a").is_empty());
        assert!(engine.status("a").unwrap().ledger_consistent);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stuck_close_does_not_hold_back_other_accounts() {
        let gw = paper();
        gw.set_price("BTCUSDT", 100.0);
        let engine = Engine::start(
            &config(vec![account("a", 10.0), account("b", 10.0)]),
            gw.clone(),
        )
        .unwrap();
        engine
            .submit(units(SignalSide::Long, 1.0).for_accounts(["a"]))
            .await;
        gw.fail_next_orders(
            "a",
            (0..200).map(|_| GatewayError::Permanent("reduce-only rejected".into())),
        );

        let closing = engine
            .enqueue(units(SignalSide::Close, 0.0).for_accounts(["a", "b"]))
            .await;
        let mut closing = Box::pin(closing.into_stream());

        let first = tokio::time::timeout(Duration::from_secs(1), closing.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.account_id, "b");
        assert_eq!(
            first.outcome,
            Outcome::Rejected(RiskRejection::NothingToClose)
        );

        let opened = tokio::time::timeout(
            Duration::from_secs(1),
            engine.submit(units(SignalSide::Long, 1.0).for_accounts(["b"])),
        )
        .await
        .unwrap();
        assert!(opened[0].outcome.is_executed());
        assert!(closing.next().now_or_never().is_none());

        let done = tokio::time::timeout(Duration::from_secs(10), closing.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.account_id, "a");
        assert_eq!(done.outcome.execution().unwrap().cause, ExecutionCause::Signal);
        assert!(engine.list_positions(Some("a")).is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn replayed_positions_match_the_live_book() {
        let engine = Engine::start(&config(vec![account("a", 10.0)]), paper()).unwrap();

        engine.submit(units(SignalSide::Long, 4.0)).await;
        engine.submit(units(SignalSide::Short, 1.5)).await;
        engine
            .submit(Signal::new("ETHUSDT", SignalSide::Short, SignalSize::Units(2.0)))
            .await;
        engine.submit(units(SignalSide::Short, 5.0)).await;

        let replayed = engine.ledger().replay_positions("a");
        let live = engine.list_positions(Some("a"));
        assert_eq!(replayed.len(), live.len());
        for pos in live {
            let h = replayed[&pos.symbol];
            assert_eq!(h.side, pos.side);
            assert!((h.size - pos.size).abs() < 1e-9);
            assert!((h.entry_price - pos.entry_price).abs() < 1e-9);
        }
        assert!(engine.status("a").unwrap().ledger_consistent);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn durable_ledger_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(vec![account("a", 10.0)]);
        cfg.ledger_path = Some(dir.path().join("ledger.jsonl"));
        let engine = Engine::start(&cfg, paper()).unwrap();

        engine.submit(units(SignalSide::Long, 1.0)).await;
        engine.shutdown().await;

        let content = std::fs::read_to_string(dir.path().join("ledger.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn unknown_targets_are_reported() {
        let engine = Engine::start(&config(vec![account("a", 10.0)]), paper()).unwrap();
        let outcomes = engine
            .submit(units(SignalSide::Long, 1.0).for_accounts(["a", "zzz"]))
            .await;
        assert!(outcome_for(&outcomes, "a").is_executed());
        assert_eq!(
            outcome_for(&outcomes, "zzz"),
            &Outcome::Rejected(RiskRejection::UnknownAccount)
        );
        assert_eq!(engine.accounts().len(), 1);
        engine.shutdown().await;
    }
}
