// =============================================================================
// Account Registry — immutable account configuration plus operator flags
// =============================================================================
//
// Built once from the configuration and shared by `Arc` with every account
// task. Everything except `enabled` and `halted` is immutable after load.
//
// Thread-safety: `enabled` is an atomic read by the owning task at signal
// acceptance, so an operator toggle is visible before the next signal.
// `halted` carries a reason and lives behind a `parking_lot::RwLock`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{AccountConfig, RiskParams};

/// One configured exchange account.
pub struct Account {
    pub id: String,
    /// Opaque handle the gateway resolves to real credentials.
    credentials: String,
    pub risk: RiskParams,
    enabled: AtomicBool,
    halted: RwLock<Option<String>>,
}

impl Account {
    pub fn new(id: impl Into<String>, credentials: impl Into<String>, risk: RiskParams) -> Self {
        Self {
            id: id.into(),
            credentials: credentials.into(),
            risk,
            enabled: AtomicBool::new(true),
            halted: RwLock::new(None),
        }
    }

    fn from_config(cfg: &AccountConfig) -> Self {
        let account = Self::new(cfg.id.clone(), cfg.credentials.clone(), cfg.risk.clone());
        account.enabled.store(cfg.enabled, Ordering::SeqCst);
        account
    }

    pub fn credentials(&self) -> &str {
        &self.credentials
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Reason new signals are refused after a ledger failure, if any.
    pub fn halt_reason(&self) -> Option<String> {
        self.halted.read().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("risk", &self.risk)
            .field("enabled", &self.is_enabled())
            .field("halted", &self.is_halted())
            .finish()
    }
}

/// Read-mostly lookup of all accounts, in configuration order.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: HashMap<String, Arc<Account>>,
    order: Vec<String>,
}

impl AccountRegistry {
    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        let mut registry = Self::default();
        for cfg in accounts {
            registry.insert(Account::from_config(cfg));
        }
        info!(accounts = registry.order.len(), "account registry built");
        registry
    }

    /// Register an account. A later account with the same id replaces the
    /// earlier one.
    pub fn insert(&mut self, account: Account) {
        if !self.accounts.contains_key(&account.id) {
            self.order.push(account.id.clone());
        }
        self.accounts.insert(account.id.clone(), Arc::new(account));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Account>> {
        self.accounts.get(id).cloned()
    }

    /// Account ids in configuration order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Operator pause/resume. Returns `false` for an unknown account.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let Some(account) = self.accounts.get(id) else {
            return false;
        };
        let prev = account.enabled.swap(enabled, Ordering::SeqCst);
        if prev != enabled {
            info!(account = %id, enabled, "account trading flag changed");
        }
        true
    }

    /// Stop accepting signals for `id` until [`AccountRegistry::resume`].
    pub fn halt(&self, id: &str, reason: impl Into<String>) {
        if let Some(account) = self.accounts.get(id) {
            let reason = reason.into();
            warn!(account = %id, reason = %reason, "account halted — new signals refused");
            *account.halted.write() = Some(reason);
        }
    }

    /// Clear a storage halt. Returns `false` for an unknown account.
    pub fn resume(&self, id: &str) -> bool {
        let Some(account) = self.accounts.get(id) else {
            return false;
        };
        if account.halted.write().take().is_some() {
            info!(account = %id, "account halt cleared");
        }
        true
    }
}
