// =============================================================================
// Position — trailing-stop state machine for one account/symbol exposure
// =============================================================================
//
// Life-cycle:
//   Open  ->  Trailing  ->  Closing  ->  Closed
//   Open  ->  Closing   ->  Closed      (stop hit before any favourable move)
//
// Stop rules:
//   Open      stop = entry × (1 ∓ pct)
//   Trailing  stop = high-water mark × (1 ∓ pct), recomputed only when the
//             mark advances; the stop never moves against the position.
//   Trigger   long: price <= stop   short: price >= stop
//
// `Holding` is the plain (side, size, entry) arithmetic that fills apply to.
// The live position book, the paper exchange and ledger replay all go through
// `Holding::apply` so that replay reproduces live state exactly.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::{OrderSide, PositionSide};

/// Sizes below this are treated as flat.
pub const SIZE_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Holding arithmetic
// ---------------------------------------------------------------------------

/// Net exposure in one symbol: side, absolute size and average entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
}

/// What a fill did to a holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillKind {
    Opened,
    Increased,
    Reduced,
    Closed,
    Flipped,
}

/// Result of applying a fill to an optional holding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillEffect {
    pub holding: Option<Holding>,
    pub realized_pnl: f64,
    pub kind: FillKind,
}

impl Holding {
    /// Signed size: positive for longs, negative for shorts.
    pub fn signed_size(&self) -> f64 {
        self.side.direction() * self.size
    }

    /// Apply a fill of `size` at `price` to `current` (flat when `None`).
    pub fn apply(current: Option<Holding>, side: OrderSide, size: f64, price: f64) -> FillEffect {
        let fill_side = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let Some(h) = current else {
            return FillEffect {
                holding: Some(Holding {
                    side: fill_side,
                    size,
                    entry_price: price,
                }),
                realized_pnl: 0.0,
                kind: FillKind::Opened,
            };
        };

        if h.side == fill_side {
            let total = h.size + size;
            let entry_price = (h.entry_price * h.size + price * size) / total;
            return FillEffect {
                holding: Some(Holding {
                    side: h.side,
                    size: total,
                    entry_price,
                }),
                realized_pnl: 0.0,
                kind: FillKind::Increased,
            };
        }

        let direction = h.side.direction();
        if size < h.size - SIZE_EPSILON {
            FillEffect {
                holding: Some(Holding {
                    side: h.side,
                    size: h.size - size,
                    entry_price: h.entry_price,
                }),
                realized_pnl: direction * (price - h.entry_price) * size,
                kind: FillKind::Reduced,
            }
        } else if size <= h.size + SIZE_EPSILON {
            FillEffect {
                holding: None,
                realized_pnl: direction * (price - h.entry_price) * h.size,
                kind: FillKind::Closed,
            }
        } else {
            FillEffect {
                holding: Some(Holding {
                    side: fill_side,
                    size: size - h.size,
                    entry_price: price,
                }),
                realized_pnl: direction * (price - h.entry_price) * h.size,
                kind: FillKind::Flipped,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Monitored position
// ---------------------------------------------------------------------------

/// Lifecycle phase of a monitored position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionPhase {
    Open,
    Trailing,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Trailing => write!(f, "Trailing"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Effect of one price observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkOutcome {
    /// The stop ratcheted in the favourable direction.
    pub stop_moved: bool,
    /// Price crossed the stop; the position should start closing.
    pub triggered: bool,
}

/// A single supervised position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub size: f64,
    /// Best price seen since open (highest for longs, lowest for shorts).
    pub high_water_mark: f64,
    pub stop_price: f64,
    pub trailing_stop_pct: f64,
    pub phase: PositionPhase,
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Start supervising `holding` with a stop `trailing_stop_pct` percent
    /// away from the entry.
    pub fn open(
        account_id: &str,
        symbol: &str,
        holding: Holding,
        trailing_stop_pct: f64,
        at: DateTime<Utc>,
    ) -> Self {
        let stop_price = stop_from(holding.entry_price, holding.side, trailing_stop_pct);
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side: holding.side,
            entry_price: holding.entry_price,
            size: holding.size,
            high_water_mark: holding.entry_price,
            stop_price,
            trailing_stop_pct,
            phase: PositionPhase::Open,
            last_price: holding.entry_price,
            unrealized_pnl: 0.0,
            opened_at: at,
            updated_at: at,
        }
    }

    pub fn holding(&self) -> Holding {
        Holding {
            side: self.side,
            size: self.size,
            entry_price: self.entry_price,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, PositionPhase::Open | PositionPhase::Trailing)
    }

    /// Feed a price observation: track the high-water mark, ratchet the stop
    /// and report whether the stop was crossed.
    pub fn mark(&mut self, price: f64) -> MarkOutcome {
        let mut outcome = MarkOutcome::default();
        if !(price > 0.0 && price.is_finite()) {
            return outcome;
        }

        self.last_price = price;
        self.unrealized_pnl = self.side.direction() * (price - self.entry_price) * self.size;
        self.updated_at = Utc::now();

        if !self.is_active() {
            return outcome;
        }

        let advanced = match self.side {
            PositionSide::Long => price > self.high_water_mark,
            PositionSide::Short => price < self.high_water_mark,
        };

        if advanced {
            self.high_water_mark = price;
            let candidate = stop_from(price, self.side, self.trailing_stop_pct);
            let ratcheted = match self.side {
                PositionSide::Long => candidate > self.stop_price,
                PositionSide::Short => candidate < self.stop_price,
            };
            if ratcheted {
                self.stop_price = candidate;
                outcome.stop_moved = true;
            }
            self.phase = PositionPhase::Trailing;
            debug!(
                id = %self.id,
                symbol = %self.symbol,
                side = %self.side,
                high_water_mark = self.high_water_mark,
                stop = self.stop_price,
                "trailing stop updated"
            );
        }

        outcome.triggered = match self.side {
            PositionSide::Long => price <= self.stop_price,
            PositionSide::Short => price >= self.stop_price,
        };
        outcome
    }

    /// Replace size/entry after a fill that kept the position open. The
    /// high-water mark and stop are preserved so the stop never regresses.
    pub fn resize(&mut self, holding: Holding) {
        debug_assert_eq!(holding.side, self.side);
        self.size = holding.size;
        self.entry_price = holding.entry_price;
        self.updated_at = Utc::now();
    }

    pub fn begin_closing(&mut self) {
        self.phase = PositionPhase::Closing;
        self.updated_at = Utc::now();
    }

    pub fn mark_closed(&mut self) {
        self.phase = PositionPhase::Closed;
        self.size = 0.0;
        self.unrealized_pnl = 0.0;
        self.updated_at = Utc::now();
    }
}

fn stop_from(reference: f64, side: PositionSide, pct: f64) -> f64 {
    reference * (1.0 - side.direction() * pct / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn long_at(entry: f64, pct: f64) -> Position {
        let holding = Holding {
            side: PositionSide::Long,
            size: 1.0,
            entry_price: entry,
        };
        Position::open("acct", "BTCUSDT", holding, pct, Utc::now())
    }

    fn short_at(entry: f64, pct: f64) -> Position {
        let holding = Holding {
            side: PositionSide::Short,
            size: 1.0,
            entry_price: entry,
        };
        Position::open("acct", "BTCUSDT", holding, pct, Utc::now())
    }

    #[test]
    fn open_stop_is_offset_from_entry() {
        let long = long_at(100.0, 5.0);
        assert!((long.stop_price - 95.0).abs() < EPS);
        assert_eq!(long.phase, PositionPhase::Open);

        let short = short_at(100.0, 5.0);
        assert!((short.stop_price - 105.0).abs() < EPS);
    }

    #[test]
    fn long_trailing_scenario() {
        let mut pos = long_at(100.0, 5.0);

        let o = pos.mark(120.0);
        assert!(o.stop_moved);
        assert!(!o.triggered);
        assert!((pos.stop_price - 114.0).abs() < EPS);
        assert_eq!(pos.phase, PositionPhase::Trailing);

        let o = pos.mark(115.0);
        assert!(!o.stop_moved);
        assert!(!o.triggered);
        assert!((pos.stop_price - 114.0).abs() < EPS, "stop must not regress");

        let o = pos.mark(113.0);
        assert!(o.triggered);
        assert!((pos.stop_price - 114.0).abs() < EPS);
    }

    #[test]
    fn short_stop_only_falls() {
        let mut pos = short_at(100.0, 5.0);
        pos.mark(80.0);
        assert!((pos.stop_price - 84.0).abs() < EPS);
        let o = pos.mark(83.0);
        assert!(!o.triggered);
        assert!((pos.stop_price - 84.0).abs() < EPS);
        let o = pos.mark(84.5);
        assert!(o.triggered);
    }

    #[test]
    fn stop_sequence_is_monotonic_over_a_price_walk() {
        let walk = [
            100.0, 101.5, 99.0, 104.0, 103.0, 110.0, 108.0, 112.5, 111.0, 118.0, 117.0,
        ];
        let mut long = long_at(100.0, 3.0);
        let mut short = short_at(120.0, 3.0);
        let mut last_long = long.stop_price;
        let mut last_short = short.stop_price;
        for price in walk {
            long.mark(price);
            short.mark(240.0 - price);
            assert!(long.stop_price >= last_long);
            assert!(short.stop_price <= last_short);
            last_long = long.stop_price;
            last_short = short.stop_price;
        }
    }

    #[test]
    fn stop_hit_before_any_favourable_move() {
        let mut pos = long_at(100.0, 5.0);
        let o = pos.mark(94.0);
        assert!(o.triggered);
        assert_eq!(pos.phase, PositionPhase::Open);
    }

    #[test]
    fn closing_positions_do_not_ratchet() {
        let mut pos = long_at(100.0, 5.0);
        pos.begin_closing();
        let o = pos.mark(150.0);
        assert_eq!(o, MarkOutcome::default());
        assert!((pos.stop_price - 95.0).abs() < EPS);
        assert!((pos.last_price - 150.0).abs() < EPS);
    }

    #[test]
    fn invalid_prices_are_ignored() {
        let mut pos = long_at(100.0, 5.0);
        assert_eq!(pos.mark(0.0), MarkOutcome::default());
        assert_eq!(pos.mark(f64::NAN), MarkOutcome::default());
        assert!((pos.last_price - 100.0).abs() < EPS);
    }

    #[test]
    fn holding_scale_in_averages_entry() {
        let first = Holding::apply(None, OrderSide::Buy, 2.0, 100.0);
        assert_eq!(first.kind, FillKind::Opened);
        let second = Holding::apply(first.holding, OrderSide::Buy, 2.0, 110.0);
        assert_eq!(second.kind, FillKind::Increased);
        let h = second.holding.unwrap();
        assert!((h.size - 4.0).abs() < EPS);
        assert!((h.entry_price - 105.0).abs() < EPS);
    }

    #[test]
    fn holding_reduce_close_and_flip_realize_pnl() {
        let long = Holding::apply(None, OrderSide::Buy, 4.0, 100.0).holding;

        let reduced = Holding::apply(long, OrderSide::Sell, 1.0, 110.0);
        assert_eq!(reduced.kind, FillKind::Reduced);
        assert!((reduced.realized_pnl - 10.0).abs() < EPS);
        assert!((reduced.holding.unwrap().size - 3.0).abs() < EPS);

        let closed = Holding::apply(reduced.holding, OrderSide::Sell, 3.0, 90.0);
        assert_eq!(closed.kind, FillKind::Closed);
        assert!((closed.realized_pnl + 30.0).abs() < EPS);
        assert!(closed.holding.is_none());

        let flipped = Holding::apply(long, OrderSide::Sell, 6.0, 95.0);
        assert_eq!(flipped.kind, FillKind::Flipped);
        assert!((flipped.realized_pnl + 20.0).abs() < EPS);
        let h = flipped.holding.unwrap();
        assert_eq!(h.side, PositionSide::Short);
        assert!((h.size - 2.0).abs() < EPS);
        assert!((h.entry_price - 95.0).abs() < EPS);
    }
}
