// =============================================================================
// Trade Ledger — append-only audit trail of executions and failed orders
// =============================================================================
//
// Records are keyed by account and kept in append order. Every append goes
// through one mutex, so concurrent account tasks never interleave a record,
// and per-account timestamps are clamped to be non-decreasing.
//
// When a sink is configured the record is written there first; a sink failure
// is returned as `LedgerError::Storage` and the record is NOT kept in memory,
// so memory never claims more than storage holds.
//
// Statistics and position replay are pure reads over the stored executions
// using the same fill arithmetic as the live position book.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::gateway::Fill;
use crate::position::{FillKind, Holding};
use crate::types::{ExecutionCause, OrderSide};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Immutable audit record of one fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub cause: ExecutionCause,
    /// Exchange order id of the fill.
    pub order_id: String,
}

impl Execution {
    pub fn from_fill(account_id: &str, fill: &Fill, cause: ExecutionCause) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            size: fill.size,
            price: fill.price,
            timestamp: fill.timestamp,
            cause,
            order_id: fill.order_id.clone(),
        }
    }
}

/// An order the exchange refused for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOrder {
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub reason: String,
    pub attempts: u32,
    pub cause: ExecutionCause,
    pub timestamp: DateTime<Utc>,
}

/// One line of the ledger file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    Execution(Execution),
    Failure(FailedOrder),
}

// ---------------------------------------------------------------------------
// Storage sinks
// ---------------------------------------------------------------------------

/// Durable destination for ledger records.
pub trait LedgerSink: Send + Sync {
    fn write(&self, record: &LedgerRecord) -> Result<(), LedgerError>;
}

/// Appends one JSON object per line to a file.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Storage(format!("{}: {e}", parent.display())))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::Storage(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "ledger file opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }
}

impl LedgerSink for JsonlSink {
    fn write(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let line = serde_json::to_string(record)
            .map_err(|e| LedgerError::Storage(format!("serialise: {e}")))?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")
            .and_then(|_| file.flush())
            .map_err(|e| LedgerError::Storage(format!("{}: {e}", self.path.display())))
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Time range for statistics; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl StatsWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    /// The trailing `span` up to now.
    pub fn last(span: chrono::Duration) -> Self {
        Self::since(Utc::now() - span)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |f| ts >= f) && self.to.map_or(true, |t| ts <= t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    /// Executions inside the window.
    pub count: usize,
    /// Executions that realised PnL (reductions, closes, flips).
    pub closing_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// wins / losses; `None` while there are no losses.
    pub win_loss_ratio: Option<f64>,
    pub net_pnl: f64,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Records {
    executions: HashMap<String, Vec<Execution>>,
    failures: HashMap<String, Vec<FailedOrder>>,
}

/// Shared append-only ledger for all accounts.
pub struct TradeLedger {
    records: Mutex<Records>,
    sink: Option<Box<dyn LedgerSink>>,
}

impl TradeLedger {
    /// Ledger kept in memory only.
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Records::default()),
            sink: None,
        }
    }

    pub fn with_sink(sink: Box<dyn LedgerSink>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            sink: Some(sink),
        }
    }

    /// Ledger that also appends to a JSON-lines file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        Ok(Self::with_sink(Box::new(JsonlSink::open(path)?)))
    }

    /// Append an execution. Returns the record as stored (its timestamp may
    /// have been clamped forward to keep the account's sequence ordered).
    pub fn append(&self, mut execution: Execution) -> Result<Execution, LedgerError> {
        let mut records = self.records.lock();

        if let Some(last) = records
            .executions
            .get(&execution.account_id)
            .and_then(|v| v.last())
        {
            if execution.timestamp < last.timestamp {
                debug!(
                    account = %execution.account_id,
                    from = %execution.timestamp,
                    to = %last.timestamp,
                    "execution timestamp clamped to keep ledger ordered"
                );
                execution.timestamp = last.timestamp;
            }
        }

        if let Some(sink) = &self.sink {
            sink.write(&LedgerRecord::Execution(execution.clone()))?;
        }

        records
            .executions
            .entry(execution.account_id.clone())
            .or_default()
            .push(execution.clone());
        Ok(execution)
    }

    /// Record an order the exchange refused permanently.
    pub fn record_failure(&self, failure: FailedOrder) -> Result<(), LedgerError> {
        let mut records = self.records.lock();
        if let Some(sink) = &self.sink {
            sink.write(&LedgerRecord::Failure(failure.clone()))?;
        }
        records
            .failures
            .entry(failure.account_id.clone())
            .or_default()
            .push(failure);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn executions(&self, account_id: &str) -> Vec<Execution> {
        self.records
            .lock()
            .executions
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn failures(&self, account_id: &str) -> Vec<FailedOrder> {
        self.records
            .lock()
            .failures
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn execution_count(&self, account_id: &str) -> usize {
        self.records
            .lock()
            .executions
            .get(account_id)
            .map_or(0, Vec::len)
    }

    /// Rebuild the open holdings of `account_id` from its executions.
    pub fn replay_positions(&self, account_id: &str) -> BTreeMap<String, Holding> {
        let executions = self.executions(account_id);
        let mut holdings: BTreeMap<String, Holding> = BTreeMap::new();
        for exec in &executions {
            let effect = Holding::apply(
                holdings.get(&exec.symbol).copied(),
                exec.side,
                exec.size,
                exec.price,
            );
            match effect.holding {
                Some(h) => {
                    holdings.insert(exec.symbol.clone(), h);
                }
                None => {
                    holdings.remove(&exec.symbol);
                }
            }
        }
        holdings
    }

    /// Count, win/loss and net PnL of `account_id` inside `window`.
    ///
    /// The whole history is replayed so that entry prices set before the
    /// window still price the closes inside it.
    pub fn query_stats(&self, account_id: &str, window: StatsWindow) -> LedgerStats {
        let executions = self.executions(account_id);
        let mut holdings: HashMap<&str, Holding> = HashMap::new();
        let mut stats = LedgerStats::default();

        for exec in &executions {
            let effect = Holding::apply(
                holdings.get(exec.symbol.as_str()).copied(),
                exec.side,
                exec.size,
                exec.price,
            );
            match effect.holding {
                Some(h) => {
                    holdings.insert(exec.symbol.as_str(), h);
                }
                None => {
                    holdings.remove(exec.symbol.as_str());
                }
            }

            if !window.contains(exec.timestamp) {
                continue;
            }
            stats.count += 1;

            let realizing = matches!(
                effect.kind,
                FillKind::Reduced | FillKind::Closed | FillKind::Flipped
            );
            if realizing {
                stats.closing_trades += 1;
                stats.net_pnl += effect.realized_pnl;
                if effect.realized_pnl > 0.0 {
                    stats.wins += 1;
                } else if effect.realized_pnl < 0.0 {
                    stats.losses += 1;
                }
            }
        }

        stats.win_loss_ratio = if stats.losses > 0 {
            Some(stats.wins as f64 / stats.losses as f64)
        } else {
            None
        };
        stats
    }
}

impl std::fmt::Debug for TradeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self.records.lock();
        let executions: usize = records.executions.values().map(Vec::len).sum();
        let failures: usize = records.failures.values().map(Vec::len).sum();
        f.debug_struct("TradeLedger")
            .field("executions", &executions)
            .field("failures", &failures)
            .field("durable", &self.sink.is_some())
            .finish()
    }
}
