// =============================================================================
// Account Worker — the single task that owns one account's trading state
// =============================================================================
//
// Drains the account's signal queue and runs the monitor tick on a
// `tokio::time::interval`. Close signals go through the monitor's close path
// and retry until the exchange confirms. Both paths mutate the same position book, so they
// are serialised by construction: a signal never observes a half-applied
// stop close and vice versa.
//
// After every signal or tick the worker publishes a snapshot to the shared
// board that the query layer reads without touching the task.
//
// The worker is designed to be spawned once per account at engine startup:
//
//   let handle = AccountWorker::new(account, executor, settings, board)
//       .spawn(jobs, shutdown);
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::MonitorSettings;
use crate::dispatcher::{Job, JobReceiver, Outcome};
use crate::error::{DispatchError, RiskRejection};
use crate::execution::OrderExecutor;
use crate::monitor::{CloseOutcome, MonitorStats, PositionMonitor};
use crate::position::{Holding, Position};
use crate::registry::Account;
use crate::risk::{self, Exposure, RiskDecision};
use crate::types::{ExecutionCause, Signal, SignalSide};

/// Per-account signal counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignalCounters {
    pub received: u64,
    pub executed: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// What the query layer sees of one account task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountSnapshot {
    pub positions: Vec<Position>,
    pub signals: SignalCounters,
    pub monitor: MonitorStats,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Shared snapshots keyed by account id.
pub type SnapshotBoard = Arc<RwLock<HashMap<String, AccountSnapshot>>>;

/// Create a new, empty snapshot board.
pub fn new_snapshot_board() -> SnapshotBoard {
    Arc::new(RwLock::new(HashMap::new()))
}

pub struct AccountWorker {
    account: Arc<Account>,
    executor: Arc<OrderExecutor>,
    monitor: PositionMonitor,
    counters: SignalCounters,
    board: SnapshotBoard,
}

impl AccountWorker {
    pub fn new(
        account: Arc<Account>,
        executor: Arc<OrderExecutor>,
        settings: MonitorSettings,
        board: SnapshotBoard,
    ) -> Self {
        let monitor = PositionMonitor::new(account.clone(), settings);
        Self {
            account,
            executor,
            monitor,
            counters: SignalCounters::default(),
            board,
        }
    }

    pub fn spawn(self, jobs: JobReceiver, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(jobs, shutdown))
    }

    async fn run(mut self, mut jobs: JobReceiver, mut shutdown: watch::Receiver<bool>) {
        let interval_ms = self.monitor.settings().interval_ms;
        info!(account = %self.account.id, interval_ms, "account worker started");

        let mut ticker = interval(self.monitor.settings().interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        self.publish();

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.monitor.tick(&self.executor, &mut shutdown).await;
                    self.publish();
                }
                job = jobs.recv() => match job {
                    Some(Job { signal, reply }) => {
                        let outcome = self.handle_signal(signal, &mut shutdown).await;
                        // Publish first so a submitter that queries right after
                        // the outcome sees its effect.
                        self.publish();
                        if reply.send(outcome).is_err() {
                            debug!(account = %self.account.id, "submitter dropped before outcome");
                        }
                    }
                    None => break,
                },
            }
        }

        self.publish();
        info!(
            account = %self.account.id,
            open_positions = self.monitor.positions().len(),
            "account worker stopped"
        );
    }

    // -------------------------------------------------------------------------
    // Signal path
    // -------------------------------------------------------------------------

    async fn handle_signal(&mut self, signal: Signal, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        self.counters.received += 1;
        let outcome = self.execute(&signal, shutdown).await;

        match &outcome {
            Outcome::Executed(e) => {
                self.counters.executed += 1;
                info!(
                    account = %self.account.id,
                    symbol = %e.symbol,
                    side = %e.side,
                    size = e.size,
                    price = e.price,
                    "signal executed"
                );
            }
            Outcome::Rejected(reason) => {
                self.counters.rejected += 1;
                info!(
                    account = %self.account.id,
                    symbol = %signal.symbol,
                    side = %signal.side,
                    reason = %reason,
                    "signal rejected"
                );
            }
            Outcome::Failed(err) => {
                self.counters.failed += 1;
                info!(
                    account = %self.account.id,
                    symbol = %signal.symbol,
                    side = %signal.side,
                    error = %err,
                    "signal failed"
                );
            }
        }
        outcome
    }

    async fn execute(&mut self, signal: &Signal, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        if let Err(reason) = risk::account_gate(&self.account) {
            return Outcome::Rejected(reason);
        }

        let holding = self.monitor.holding(&signal.symbol);
        if signal.side == SignalSide::Close {
            return self.close(signal, holding, shutdown).await;
        }

        let balance = match self.executor.fetch_balance(&self.account).await {
            Ok(balance) => balance,
            Err(err) => return Outcome::Failed(err),
        };
        let mark_price = match self.executor.fetch_price(&self.account, &signal.symbol).await {
            Ok(price) => price,
            Err(err) => return Outcome::Failed(err),
        };

        let exposure = Exposure {
            holding,
            mark_price,
            balance,
        };
        let plan = match risk::evaluate(&self.account, signal, &exposure) {
            RiskDecision::Accept(plan) => plan,
            RiskDecision::Reject(reason) => return Outcome::Rejected(reason),
        };
        debug!(
            account = %self.account.id,
            symbol = %signal.symbol,
            side = %plan.side,
            size = plan.size,
            resulting = plan.resulting_size,
            balance,
            mark_price,
            "risk accepted"
        );

        let fill = match self
            .executor
            .place(
                &self.account,
                &signal.symbol,
                plan.side,
                plan.size,
                ExecutionCause::Signal,
            )
            .await
        {
            Ok(fill) => fill,
            Err(err) => return Outcome::Failed(err),
        };

        self.monitor.apply_fill(&fill);
        match self
            .executor
            .record(&self.account.id, &fill, ExecutionCause::Signal)
        {
            Ok(execution) => Outcome::Executed(execution),
            Err(err) => Outcome::Failed(DispatchError::Storage(err)),
        }
    }

    /// Explicit close: the position enters Closing and is retried until the
    /// exchange confirms, like a stop.
    async fn close(
        &mut self,
        signal: &Signal,
        holding: Option<Holding>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let exposure = Exposure {
            holding,
            mark_price: self
                .monitor
                .position(&signal.symbol)
                .map_or(0.0, |p| p.last_price),
            balance: self.monitor.stats().last_balance.unwrap_or(0.0),
        };
        match risk::evaluate(&self.account, signal, &exposure) {
            RiskDecision::Accept(plan) => debug!(
                account = %self.account.id,
                symbol = %signal.symbol,
                side = %plan.side,
                size = plan.size,
                "close accepted"
            ),
            RiskDecision::Reject(reason) => return Outcome::Rejected(reason),
        }

        match self
            .monitor
            .close_position(&signal.symbol, ExecutionCause::Signal, &self.executor, shutdown)
            .await
        {
            CloseOutcome::Recorded(execution) => Outcome::Executed(execution),
            CloseOutcome::Unrecorded(err) => Outcome::Failed(DispatchError::Storage(err)),
            CloseOutcome::Abandoned { attempts } => {
                Outcome::Failed(DispatchError::CloseAbandoned { attempts })
            }
            CloseOutcome::NotOpen => Outcome::Rejected(RiskRejection::NothingToClose),
        }
    }

    fn publish(&self) {
        let snapshot = AccountSnapshot {
            positions: self.monitor.positions(),
            signals: self.counters.clone(),
            monitor: self.monitor.stats().clone(),
            updated_at: Some(Utc::now()),
        };
        self.board.write().insert(self.account.id.clone(), snapshot);
    }
}

impl std::fmt::Debug for AccountWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountWorker")
            .field("account", &self.account.id)
            .field("monitor", &self.monitor)
            .field("counters", &self.counters)
            .finish()
    }
}
