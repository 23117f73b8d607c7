// =============================================================================
// Risk Engine — pre-trade gate for every signal, per account
// =============================================================================
//
// Checks, in order (the first failing check is the rejection reason):
//   1. Account enabled (and not halted after a ledger failure).
//   2. Resulting position size <= max_position_size.
//   3. Implied leverage (|size| × mark / balance) <= max_leverage.
//   4. Balance after a worst-case adverse move (one trailing-stop distance on
//      the whole resulting position) >= min_balance_threshold.
//
// Checks 3 and 4 only apply when the signal grows the position: a signal that
// shrinks exposure is never blocked by the limits it moves away from.
//
// Pure: no logging, no shared state. The caller supplies the exposure view.
// =============================================================================

use serde::Serialize;

use crate::error::RiskRejection;
use crate::position::{Holding, SIZE_EPSILON};
use crate::registry::Account;
use crate::types::{OrderSide, Signal, SignalSide, SignalSize};

/// The account's current view of one symbol, as seen by its own task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exposure {
    /// Current holding in the signal's symbol, `None` when flat.
    pub holding: Option<Holding>,
    /// Latest mark price of the symbol.
    pub mark_price: f64,
    /// Wallet balance in quote currency.
    pub balance: f64,
}

impl Exposure {
    pub fn signed_size(&self) -> f64 {
        self.holding.map(|h| h.signed_size()).unwrap_or(0.0)
    }
}

/// Order the engine allows for an accepted signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrderPlan {
    pub side: OrderSide,
    pub size: f64,
    /// Signed position size once the order fills.
    pub resulting_size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Accept(OrderPlan),
    Reject(RiskRejection),
}

#[cfg(test)]
impl RiskDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// Evaluate `signal` for `account` given its current `exposure`.
pub fn evaluate(account: &Account, signal: &Signal, exposure: &Exposure) -> RiskDecision {
    match check(account, signal, exposure) {
        Ok(plan) => RiskDecision::Accept(plan),
        Err(reason) => RiskDecision::Reject(reason),
    }
}

/// Account-level part of check 1. Needs no market data, so callers can run
/// it before reading balances or prices.
pub fn account_gate(account: &Account) -> Result<(), RiskRejection> {
    if !account.is_enabled() {
        return Err(RiskRejection::AccountDisabled);
    }
    if let Some(cause) = account.halt_reason() {
        return Err(RiskRejection::AccountHalted { cause });
    }
    Ok(())
}

fn check(account: &Account, signal: &Signal, exposure: &Exposure) -> Result<OrderPlan, RiskRejection> {
    // 1. Account state
    account_gate(account)?;

    // Close signals only ever reduce exposure.
    let side = match signal.side {
        SignalSide::Close => {
            let holding = exposure.holding.ok_or(RiskRejection::NothingToClose)?;
            return Ok(OrderPlan {
                side: holding.side.closing_order(),
                size: holding.size,
                resulting_size: 0.0,
            });
        }
        SignalSide::Long => OrderSide::Buy,
        SignalSide::Short => OrderSide::Sell,
    };

    if !(exposure.mark_price > 0.0 && exposure.mark_price.is_finite()) {
        return Err(RiskRejection::InvalidSignal {
            detail: format!("no usable mark price for {}", signal.symbol),
        });
    }

    let size = resolve_size(account, signal.size, exposure)?;
    let current = exposure.signed_size();
    let resulting = current + side.sign() * size;
    let limits = &account.risk;

    // 2. Position size
    if resulting.abs() > limits.max_position_size + SIZE_EPSILON {
        return Err(RiskRejection::ExceedsMaxPositionSize {
            resulting: resulting.abs(),
            limit: limits.max_position_size,
        });
    }

    let plan = OrderPlan {
        side,
        size,
        resulting_size: resulting,
    };
    if resulting.abs() <= current.abs() + SIZE_EPSILON {
        return Ok(plan);
    }

    // 3. Leverage
    let notional = resulting.abs() * exposure.mark_price;
    let implied = if exposure.balance > 0.0 {
        notional / exposure.balance
    } else {
        f64::INFINITY
    };
    if implied > limits.max_leverage {
        return Err(RiskRejection::ExceedsMaxLeverage {
            implied,
            limit: limits.max_leverage,
        });
    }

    // 4. Balance floor after a worst-case adverse move
    let projected = exposure.balance - notional * limits.trailing_stop_pct / 100.0;
    if projected < limits.min_balance_threshold {
        return Err(RiskRejection::BalanceFloor {
            projected,
            floor: limits.min_balance_threshold,
        });
    }

    Ok(plan)
}

/// Turn the requested size into base units.
fn resolve_size(account: &Account, size: SignalSize, exposure: &Exposure) -> Result<f64, RiskRejection> {
    let units = match size {
        SignalSize::Units(u) => u,
        SignalSize::Fraction(f) => {
            if !(f > 0.0 && f <= 1.0) {
                return Err(RiskRejection::InvalidSignal {
                    detail: format!("size fraction {f} outside (0, 1]"),
                });
            }
            exposure.balance * f * account.risk.max_leverage / exposure.mark_price
        }
    };
    if !(units > SIZE_EPSILON && units.is_finite()) {
        return Err(RiskRejection::InvalidSignal {
            detail: format!("order size {units} must be positive"),
        });
    }
    Ok(units)
}
