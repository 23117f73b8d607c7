// =============================================================================
// Signal Executor — Main Entry Point
// =============================================================================
//
// Reads one JSON object per line on stdin. A line is either a trade signal
//
//   {"symbol":"BTCUSDT","side":"long","size":{"units":0.01}}
//
// or an operator command (`{"command":"status"}`, `{"command":"disable",
// "account":"account1"}`, ...). Commands are answered right away; a signal
// produces one JSON line per account as each account finishes, so an account
// stuck closing a position never holds up the rest. Logs go to stderr.
//
// Orders go to the in-process paper exchange; `price` and `balance` commands
// drive its market.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod backoff;
mod config;
mod dispatcher;
mod engine;
mod error;
mod execution;
mod gateway;
mod ledger;
mod monitor;
mod position;
mod registry;
mod risk;
mod types;
mod worker;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ExecutorConfig;
use crate::engine::Engine;
use crate::gateway::paper::PaperGateway;
use crate::ledger::StatsWindow;
use crate::types::Signal;

const DEFAULT_CONFIG_PATH: &str = "executor_config.json";

/// Output lines buffered ahead of stdout.
const OUTPUT_BUFFER: usize = 1024;

/// Operator commands accepted on the input stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum OperatorCommand {
    Status {
        #[serde(default)]
        account: Option<String>,
    },
    Positions {
        #[serde(default)]
        account: Option<String>,
    },
    Stats {
        account: String,
        #[serde(default)]
        since: Option<DateTime<Utc>>,
        /// Trailing window in seconds; takes precedence over `since`.
        #[serde(default)]
        last_secs: Option<i64>,
    },
    Enable {
        account: String,
    },
    Disable {
        account: String,
    },
    Resume {
        account: String,
    },
    Failures {
        account: String,
    },
    Alerts {
        account: String,
        #[serde(default = "default_alert_count")]
        count: usize,
    },
    /// Set a paper market price.
    Price {
        symbol: String,
        price: f64,
    },
    /// Set a paper account balance.
    Balance {
        account: String,
        balance: f64,
    },
}

fn default_alert_count() -> usize {
    20
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Command(OperatorCommand),
    Signal(Signal),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Signal Executor — starting up");

    let config_path =
        std::env::var("EXECUTOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = if Path::new(&config_path).exists() {
        ExecutorConfig::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, writing defaults");
        let config = ExecutorConfig::default();
        if let Err(e) = config.save(&config_path) {
            warn!(error = %e, "failed to write default config");
        }
        config
    };

    for account in &config.accounts {
        info!(
            account = %account.id,
            enabled = account.enabled,
            max_position_size = account.risk.max_position_size,
            max_leverage = account.risk.max_leverage,
            min_balance_threshold = account.risk.min_balance_threshold,
            trailing_stop_pct = account.risk.trailing_stop_pct,
            "account configured"
        );
    }

    // ── 2. Engine ────────────────────────────────────────────────────────
    let gateway = Arc::new(PaperGateway::from_settings(&config.paper));
    let engine = Engine::start(&config, gateway.clone())?;

    // ── 3. Output writer ─────────────────────────────────────────────────
    let (out_tx, mut out_rx) = mpsc::channel::<serde_json::Value>(OUTPUT_BUFFER);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(value) = out_rx.recv().await {
            if let Err(e) = write_line(&mut stdout, &value).await {
                error!(error = %e, "failed to write output");
                break;
            }
        }
    });

    // ── 4. Input loop ────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
    let mut interrupted = false;

    info!("ready — reading signals from stdin");

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Shutdown signal received — stopping gracefully");
                interrupted = true;
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_line(line) {
                        Ok(InputLine::Signal(signal)) => {
                            // Queue order is fixed here; outcomes print as
                            // each account finishes.
                            let dispatch = engine.enqueue(signal).await;
                            let out = out_tx.clone();
                            in_flight.retain(|handle| !handle.is_finished());
                            in_flight.push(tokio::spawn(async move {
                                let mut outcomes = Box::pin(dispatch.into_stream());
                                while let Some(outcome) = outcomes.next().await {
                                    if out.send(outcome.to_json()).await.is_err() {
                                        break;
                                    }
                                }
                            }));
                        }
                        Ok(InputLine::Command(command)) => {
                            let reply = handle_command(&engine, &gateway, command);
                            if out_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Err(reply) => {
                            if out_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {
                    info!("input closed — stopping");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to read input");
                    break;
                }
            }
        }
    }

    in_flight.retain(|handle| !handle.is_finished());
    if !interrupted && !in_flight.is_empty() {
        info!(pending = in_flight.len(), "waiting for in-flight signals");
        tokio::select! {
            _ = wait_all(&mut in_flight) => {}
            _ = &mut ctrl_c => warn!("interrupted while waiting for in-flight signals"),
        }
    }

    // ── 5. Final report & shutdown ───────────────────────────────────────
    for status in engine.accounts() {
        let stats = engine
            .get_stats(&status.id, StatsWindow::all())
            .unwrap_or_default();
        info!(
            account = %status.id,
            enabled = status.enabled,
            open_positions = status.open_positions,
            executions = stats.count,
            wins = stats.wins,
            losses = stats.losses,
            net_pnl = format!("{:.4}", stats.net_pnl),
            stop_adjustments = status.monitor.stop_adjustments,
            ledger_consistent = status.ledger_consistent,
            "final account stats"
        );
    }

    engine.shutdown().await;
    // Abandoned work has been answered by now.
    wait_all(&mut in_flight).await;
    drop(out_tx);
    if let Err(e) = writer.await {
        error!(error = %e, "output writer failed");
    }
    info!("Signal Executor stopped");
    Ok(())
}

/// Wait for every outcome task still in `handles`.
async fn wait_all(handles: &mut Vec<JoinHandle<()>>) {
    for result in join_all(handles.iter_mut()).await {
        if let Err(e) = result {
            error!(error = %e, "outcome task failed");
        }
    }
    handles.clear();
}

async fn write_line(stdout: &mut Stdout, value: &serde_json::Value) -> std::io::Result<()> {
    stdout.write_all(format!("{value}\n").as_bytes()).await?;
    stdout.flush().await
}

/// Parse one input line; a parse failure becomes the error reply to print.
fn parse_line(line: &str) -> Result<InputLine, serde_json::Value> {
    serde_json::from_str(line).map_err(|e| {
        warn!(error = %e, "unparseable input line");
        json!({ "status": "error", "error": format!("invalid input: {e}") })
    })
}

fn handle_command(engine: &Engine, paper: &PaperGateway, command: OperatorCommand) -> serde_json::Value {
    let unknown = |account: &str| json!({ "status": "error", "error": format!("unknown account {account}") });

    match command {
        OperatorCommand::Status { account: Some(id) } => match engine.status(&id) {
            Some(status) => json!({ "status": "ok", "account": status }),
            None => unknown(&id),
        },
        OperatorCommand::Status { account: None } => {
            json!({ "status": "ok", "accounts": engine.accounts() })
        }
        OperatorCommand::Positions { account } => {
            json!({ "status": "ok", "positions": engine.list_positions(account.as_deref()) })
        }
        OperatorCommand::Stats {
            account,
            since,
            last_secs,
        } => {
            let window = match (last_secs, since) {
                (Some(secs), _) => StatsWindow::last(chrono::Duration::seconds(secs)),
                (None, Some(from)) => StatsWindow::since(from),
                (None, None) => StatsWindow::all(),
            };
            match engine.get_stats(&account, window) {
                Some(stats) => json!({ "status": "ok", "account": account, "stats": stats }),
                None => unknown(&account),
            }
        }
        OperatorCommand::Enable { account } | OperatorCommand::Disable { account }
            if engine.registry().get(&account).is_none() =>
        {
            unknown(&account)
        }
        OperatorCommand::Enable { account } => {
            engine.set_enabled(&account, true);
            json!({ "status": "ok", "account": account, "enabled": true })
        }
        OperatorCommand::Disable { account } => {
            engine.set_enabled(&account, false);
            json!({ "status": "ok", "account": account, "enabled": false })
        }
        OperatorCommand::Resume { account } => {
            if engine.resume(&account) {
                json!({ "status": "ok", "account": account, "halted": false })
            } else {
                unknown(&account)
            }
        }
        OperatorCommand::Failures { account } => {
            json!({ "status": "ok", "account": account, "failures": engine.failures(&account) })
        }
        OperatorCommand::Alerts { account, count } => {
            json!({ "status": "ok", "account": account, "alerts": engine.alerts(&account, count) })
        }
        OperatorCommand::Price { symbol, price } => {
            if !(price > 0.0 && price.is_finite()) {
                return json!({ "status": "error", "error": format!("invalid price {price}") });
            }
            paper.set_price(&symbol, price);
            json!({ "status": "ok", "symbol": symbol.to_uppercase(), "price": price })
        }
        OperatorCommand::Balance { account, balance } => {
            if engine.registry().get(&account).is_none() {
                return unknown(&account);
            }
            paper.set_balance(&account, balance);
            json!({ "status": "ok", "account": account, "balance": balance })
        }
    }
}
