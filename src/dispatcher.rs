// =============================================================================
// Signal Dispatcher — fans a signal out to the targeted account tasks
// =============================================================================
//
// Each account has one bounded FIFO queue drained by its own task, so signals
// for one account are processed strictly in submission order while different
// accounts proceed independently. `enqueue` puts the signal on every target's
// queue and hands back a `Dispatch`; the replies are awaited separately, so
// an account stuck in a close never holds back intake or the outcomes of the
// other accounts.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, Stream};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, RiskRejection};
use crate::ledger::Execution;
use crate::registry::AccountRegistry;
use crate::types::{Signal, Targets};

/// Queue handle of one account task.
pub type JobSender = mpsc::Sender<Job>;
pub type JobReceiver = mpsc::Receiver<Job>;

/// One signal on its way to one account.
#[derive(Debug)]
pub struct Job {
    pub signal: Signal,
    pub reply: oneshot::Sender<Outcome>,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to a signal for one account.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Executed(Execution),
    Rejected(RiskRejection),
    Failed(DispatchError),
}

#[cfg(test)]
impl Outcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }

    pub fn execution(&self) -> Option<&Execution> {
        match self {
            Self::Executed(e) => Some(e),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&RiskRejection> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executed(e) => write!(f, "Executed({} {} {} @ {})", e.symbol, e.side, e.size, e.price),
            Self::Rejected(r) => write!(f, "Rejected({r})"),
            Self::Failed(e) => write!(f, "Failed({e})"),
        }
    }
}

/// Outcome tagged with the account it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountOutcome {
    pub account_id: String,
    pub outcome: Outcome,
}

impl AccountOutcome {
    /// JSON form written to the signal output stream.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.outcome {
            Outcome::Executed(e) => json!({
                "account": self.account_id,
                "status": "executed",
                "execution": e,
            }),
            Outcome::Rejected(r) => json!({
                "account": self.account_id,
                "status": "rejected",
                "rejection": r,
                "message": r.to_string(),
            }),
            Outcome::Failed(e) => json!({
                "account": self.account_id,
                "status": "failed",
                "error": e.to_string(),
            }),
        }
    }
}

#[derive(Debug)]
enum Pending {
    Ready(Outcome),
    Waiting(oneshot::Receiver<Outcome>),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    registry: Arc<AccountRegistry>,
    queues: HashMap<String, JobSender>,
}

impl Dispatcher {
    pub fn new(registry: Arc<AccountRegistry>) -> Self {
        Self {
            registry,
            queues: HashMap::new(),
        }
    }

    /// Route signals for `account_id` into `queue`.
    pub fn attach(&mut self, account_id: &str, queue: JobSender) {
        self.queues.insert(account_id.to_string(), queue);
    }

    /// Drop every queue handle; account tasks exit once drained.
    pub fn close(&mut self) {
        self.queues.clear();
    }

    /// Account ids a signal addresses, deduplicated, in order.
    pub fn resolve_targets(&self, targets: &Targets) -> Vec<String> {
        match targets {
            Targets::All => self.registry.ids().to_vec(),
            Targets::Accounts(ids) => {
                let mut seen = HashSet::new();
                ids.iter()
                    .filter(|id| seen.insert(id.as_str()))
                    .cloned()
                    .collect()
            }
        }
    }

    /// Deliver `signal` to its targets and wait for every account's outcome.
    pub async fn submit(&self, signal: Signal) -> Vec<AccountOutcome> {
        self.enqueue(signal).await.collect().await
    }

    /// Put `signal` on every target's queue and return without waiting for
    /// the accounts. Queue order, and with it per-account FIFO, is fixed when
    /// this returns.
    pub async fn enqueue(&self, mut signal: Signal) -> Dispatch {
        signal.symbol = signal.symbol.trim().to_uppercase();
        let targets = self.resolve_targets(&signal.targets);

        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            size = ?signal.size,
            targets = targets.len(),
            "signal received"
        );

        let invalid = signal.symbol.is_empty().then(|| RiskRejection::InvalidSignal {
            detail: "symbol must not be empty".to_string(),
        });

        let mut pending = Vec::with_capacity(targets.len());
        for account_id in targets {
            let state = if let Some(reason) = &invalid {
                Pending::Ready(Outcome::Rejected(reason.clone()))
            } else if let Some(queue) = self.queues.get(&account_id) {
                let (reply, rx) = oneshot::channel();
                let job = Job {
                    signal: signal.clone(),
                    reply,
                };
                match queue.send(job).await {
                    Ok(()) => Pending::Waiting(rx),
                    Err(_) => {
                        warn!(account = %account_id, "account queue closed");
                        Pending::Ready(Outcome::Failed(DispatchError::WorkerUnavailable))
                    }
                }
            } else if self.registry.get(&account_id).is_none() {
                debug!(account = %account_id, "signal addressed to unknown account");
                Pending::Ready(Outcome::Rejected(RiskRejection::UnknownAccount))
            } else {
                Pending::Ready(Outcome::Failed(DispatchError::WorkerUnavailable))
            };
            pending.push((account_id, state));
        }

        Dispatch { pending }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A signal already queued to its accounts, with their outcomes still to
/// come.
#[derive(Debug)]
pub struct Dispatch {
    pending: Vec<(String, Pending)>,
}

impl Dispatch {
    /// Wait for every account, outcomes in target order.
    pub async fn collect(self) -> Vec<AccountOutcome> {
        join_all(self.pending.into_iter().map(|(id, state)| resolve(id, state))).await
    }

    /// Outcomes in the order the accounts finish, so a slow account does not
    /// hold back the others.
    pub fn into_stream(self) -> impl Stream<Item = AccountOutcome> {
        self.pending
            .into_iter()
            .map(|(id, state)| resolve(id, state))
            .collect::<FuturesUnordered<_>>()
    }
}

async fn resolve(account_id: String, state: Pending) -> AccountOutcome {
    let outcome = match state {
        Pending::Ready(outcome) => outcome,
        Pending::Waiting(rx) => rx
            .await
            .unwrap_or(Outcome::Failed(DispatchError::WorkerUnavailable)),
    };
    AccountOutcome {
        account_id,
        outcome,
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("accounts", &self.registry.len())
            .field("queues", &self.queues.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    use crate::config::RiskParams;
    use crate::registry::Account;
    use crate::types::{SignalSide, SignalSize};

    fn registry(ids: &[&str]) -> Arc<AccountRegistry> {
        let mut registry = AccountRegistry::default();
        for id in ids {
            registry.insert(Account::new(*id, "paper", RiskParams::default()));
        }
        Arc::new(registry)
    }

    #[test]
    fn explicit_targets_are_deduplicated_in_order() {
        let d = Dispatcher::new(registry(&["a", "b"]));
        let targets = Targets::Accounts(vec!["b".into(), "a".into(), "b".into()]);
        assert_eq!(d.resolve_targets(&targets), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(d.resolve_targets(&Targets::All), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn unknown_and_detached_accounts_answer_immediately() {
        let d = Dispatcher::new(registry(&["a"]));
        let signal = Signal::new("BTCUSDT", SignalSide::Long, SignalSize::Units(1.0))
            .for_accounts(["a", "ghost"]);

        let outcomes = d.submit(signal).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[0].outcome,
            Outcome::Failed(DispatchError::WorkerUnavailable)
        );
        assert_eq!(
            outcomes[1].outcome,
            Outcome::Rejected(RiskRejection::UnknownAccount)
        );
    }

    #[tokio::test]
    async fn symbol_is_normalised_before_delivery() {
        let mut d = Dispatcher::new(registry(&["a"]));
        let (tx, mut rx) = mpsc::channel(4);
        d.attach("a", tx);

        let worker = tokio::spawn(async move {
            let job: Job = rx.recv().await.unwrap();
            let symbol = job.signal.symbol.clone();
            let _ = job
                .reply
                .send(Outcome::Rejected(RiskRejection::NothingToClose));
            symbol
        });

        let mut signal = Signal::new("x", SignalSide::Close, SignalSize::Units(1.0));
        signal.symbol = " ethusdt ".into();
        let outcomes = d.submit(signal).await;
        assert_eq!(worker.await.unwrap(), "ETHUSDT");
        assert_eq!(
            outcomes[0].outcome.rejection(),
            Some(&RiskRejection::NothingToClose)
        );
    }

    #[tokio::test]
    async fn empty_symbol_is_rejected_without_delivery() {
        let mut d = Dispatcher::new(registry(&["a"]));
        let (tx, mut rx) = mpsc::channel(4);
        d.attach("a", tx);

        let mut signal = Signal::new("x", SignalSide::Long, SignalSize::Units(1.0));
        signal.symbol = "  ".into();
        let outcomes = d.submit(signal).await;
        assert!(matches!(
            outcomes[0].outcome,
            Outcome::Rejected(RiskRejection::InvalidSignal { .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_yields_outcomes_as_accounts_finish() {
        let mut d = Dispatcher::new(registry(&["slow", "fast"]));
        let (slow_tx, mut slow_rx) = mpsc::channel::<Job>(4);
        let (fast_tx, mut fast_rx) = mpsc::channel::<Job>(4);
        d.attach("slow", slow_tx);
        d.attach("fast", fast_tx);

        let (release, released) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let job = slow_rx.recv().await.unwrap();
            let _ = released.await;
            let _ = job.reply.send(Outcome::Rejected(RiskRejection::NothingToClose));
        });
        tokio::spawn(async move {
            while let Some(job) = fast_rx.recv().await {
                let _ = job.reply.send(Outcome::Rejected(RiskRejection::AccountDisabled));
            }
        });

        let dispatch = d
            .enqueue(Signal::new("BTCUSDT", SignalSide::Long, SignalSize::Units(1.0)))
            .await;
        let mut outcomes = Box::pin(dispatch.into_stream());

        let first = tokio::time::timeout(std::time::Duration::from_secs(1), outcomes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.account_id, "fast");

        release.send(()).unwrap();
        let second = outcomes.next().await.unwrap();
        assert_eq!(second.account_id, "slow");
        assert!(outcomes.next().await.is_none());
    }

    #[test]
    fn outcome_json_carries_status_and_reason() {
        let out = AccountOutcome {
            account_id: "a".into(),
            outcome: Outcome::Rejected(RiskRejection::ExceedsMaxPositionSize {
                resulting: 11.0,
                limit: 10.0,
            }),
        };
        let v = out.to_json();
        assert_eq!(v["status"], "rejected");
        assert_eq!(v["rejection"]["reason"], "exceeds_max_position_size");
        assert_eq!(v["account"], "a");
    }
}
