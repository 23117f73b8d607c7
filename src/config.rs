// =============================================================================
// Executor Configuration — per-account risk parameters and engine tuning
// =============================================================================
//
// Loaded once at startup and handed to the engine as an immutable value.
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_max_position_size() -> f64 {
    1.0
}

fn default_max_leverage() -> f64 {
    5.0
}

fn default_min_balance_threshold() -> f64 {
    100.0
}

fn default_trailing_stop_pct() -> f64 {
    5.0
}

fn default_monitor_interval_ms() -> u64 {
    5_000
}

fn default_alert_every_attempts() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_close_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.1
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_ledger_path() -> Option<PathBuf> {
    Some(PathBuf::from("ledger.jsonl"))
}

fn default_starting_balance() -> f64 {
    1_000.0
}

fn default_accounts() -> Vec<AccountConfig> {
    vec![
        AccountConfig {
            id: "account1".to_string(),
            credentials: "paper:account1".to_string(),
            enabled: true,
            risk: RiskParams {
                max_position_size: 0.5,
                max_leverage: 5.0,
                min_balance_threshold: 100.0,
                trailing_stop_pct: 5.0,
            },
        },
        AccountConfig {
            id: "account2".to_string(),
            credentials: "paper:account2".to_string(),
            enabled: true,
            risk: RiskParams {
                max_position_size: 1.0,
                max_leverage: 10.0,
                min_balance_threshold: 200.0,
                trailing_stop_pct: 8.0,
            },
        },
    ]
}

// =============================================================================
// RiskParams
// =============================================================================

/// Account-specific limits enforced by the risk engine and the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParams {
    /// Largest absolute position (base units) allowed per symbol.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,

    /// Largest notional / balance ratio allowed after a fill.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,

    /// Balance floor (quote currency). Falling below it flattens the account.
    #[serde(default = "default_min_balance_threshold")]
    pub min_balance_threshold: f64,

    /// Trailing stop distance as a percentage (5.0 means 5 %).
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            max_leverage: default_max_leverage(),
            min_balance_threshold: default_min_balance_threshold(),
            trailing_stop_pct: default_trailing_stop_pct(),
        }
    }
}

// =============================================================================
// AccountConfig
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,

    /// Opaque credential handle resolved by the gateway. Never logged.
    #[serde(default)]
    pub credentials: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub risk: RiskParams,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("credentials", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("risk", &self.risk)
            .finish()
    }
}

// =============================================================================
// Monitor / retry tuning
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Tick interval of every account's supervisory loop.
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    /// Raise an alert every N consecutive failures of a close or poll.
    #[serde(default = "default_alert_every_attempts")]
    pub alert_every_attempts: u32,

    /// Disable the account after a balance breach flattened it.
    #[serde(default = "default_true")]
    pub disable_on_breach: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            alert_every_attempts: default_alert_every_attempts(),
            disable_on_breach: true,
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts for an ordinary order placement (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Delay cap for the unbounded close retry loop.
    #[serde(default = "default_close_max_delay_ms")]
    pub close_max_delay_ms: u64,

    /// Jitter as a fraction of each delay (0.0 to 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            close_max_delay_ms: default_close_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Settings for the in-process paper exchange used by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperSettings {
    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,

    /// Initial mark prices keyed by symbol.
    #[serde(default)]
    pub prices: HashMap<String, f64>,
}

impl Default for PaperSettings {
    fn default() -> Self {
        let mut prices = HashMap::new();
        prices.insert("BTCUSDT".to_string(), 60_000.0);
        prices.insert("ETHUSDT".to_string(), 3_000.0);
        Self {
            starting_balance: default_starting_balance(),
            prices,
        }
    }
}

// =============================================================================
// ExecutorConfig
// =============================================================================

/// Top-level configuration for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_accounts")]
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Deadline applied to every individual gateway call.
    #[serde(default = "default_gateway_timeout_ms")]
    pub gateway_timeout_ms: u64,

    /// Pending signals buffered per account before submitters wait.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// JSON-lines file the ledger appends to. `None` keeps it in memory.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: Option<PathBuf>,

    #[serde(default)]
    pub paper: PaperSettings,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            accounts: default_accounts(),
            monitor: MonitorSettings::default(),
            retry: RetrySettings::default(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            ledger_path: default_ledger_path(),
            paper: PaperSettings::default(),
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from a JSON file at `path` and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read executor config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse executor config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid executor config in {}", path.display()))?;

        info!(
            path = %path.display(),
            accounts = config.accounts.len(),
            monitor_interval_ms = config.monitor.interval_ms,
            "executor config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise executor config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "executor config saved (atomic)");
        Ok(())
    }

    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("at least one account must be configured");
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                bail!("account id must not be empty");
            }
            if !seen.insert(account.id.as_str()) {
                bail!("duplicate account id '{}'", account.id);
            }
            let r = &account.risk;
            if !(r.max_position_size > 0.0 && r.max_position_size.is_finite()) {
                bail!("account '{}': max_position_size must be positive", account.id);
            }
            if !(r.max_leverage > 0.0 && r.max_leverage.is_finite()) {
                bail!("account '{}': max_leverage must be positive", account.id);
            }
            if !(r.min_balance_threshold >= 0.0 && r.min_balance_threshold.is_finite()) {
                bail!("account '{}': min_balance_threshold must be >= 0", account.id);
            }
            if !(r.trailing_stop_pct > 0.0 && r.trailing_stop_pct < 100.0) {
                bail!("account '{}': trailing_stop_pct must be in (0, 100)", account.id);
            }
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        Ok(())
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms.max(1))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.accounts.len(), 2);
        assert_eq!(cfg.accounts[0].id, "account1");
        assert!(cfg.accounts.iter().all(|a| a.enabled));
        assert_eq!(cfg.monitor.interval_ms, 5_000);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.monitor.disable_on_breach);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "accounts": [
                { "id": "main", "risk": { "max_position_size": 10.0 } }
            ],
            "monitor": { "interval_ms": 250 }
        }"#;
        let cfg: ExecutorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.accounts.len(), 1);
        let acct = &cfg.accounts[0];
        assert!(acct.enabled);
        assert!((acct.risk.max_position_size - 10.0).abs() < f64::EPSILON);
        assert!((acct.risk.trailing_stop_pct - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.monitor.interval_ms, 250);
        assert_eq!(cfg.monitor.alert_every_attempts, 5);
        assert_eq!(cfg.queue_capacity, 64);
    }

    #[test]
    fn duplicate_account_ids_are_rejected() {
        let mut cfg = ExecutorConfig::default();
        cfg.accounts[1].id = cfg.accounts[0].id.clone();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn trailing_stop_pct_must_be_a_percentage() {
        let mut cfg = ExecutorConfig::default();
        cfg.accounts[0].risk.trailing_stop_pct = 0.0;
        assert!(cfg.validate().is_err());
        cfg.accounts[0].risk.trailing_stop_pct = 100.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let mut acct = ExecutorConfig::default().accounts.remove(0);
        acct.credentials = "super-secret".to_string();
        let rendered = format!("{acct:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor_config.json");
        let cfg = ExecutorConfig::default();
        cfg.save(&path).unwrap();
        let loaded = ExecutorConfig::load(&path).unwrap();
        assert_eq!(loaded.accounts.len(), cfg.accounts.len());
        assert_eq!(loaded.accounts[1].risk, cfg.accounts[1].risk);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
