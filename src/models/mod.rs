use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV candle, either from the live stream or from historical
/// backfill. Immutable once received; `is_closed` distinguishes a committed
/// candle from a still-forming one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// Discrete trading signal kinds emitted by the signal engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalKind {
    /// EMA5 crossed above EMA50.
    CrossUp,
    /// EMA5 crossed below EMA50.
    CrossDown,
    /// Local maximum in the EMA5 trajectory, trend reversing down.
    ArcTop,
    /// Local minimum in the EMA5 trajectory, trend reversing up.
    ArcBottom,
}

impl SignalKind {
    pub fn is_crossover(&self) -> bool {
        matches!(self, SignalKind::CrossUp | SignalKind::CrossDown)
    }

    pub fn is_arc(&self) -> bool {
        matches!(self, SignalKind::ArcTop | SignalKind::ArcBottom)
    }

    /// The position direction this signal argues for.
    pub fn implied_direction(&self) -> Direction {
        match self {
            SignalKind::CrossUp | SignalKind::ArcBottom => Direction::Long,
            SignalKind::CrossDown | SignalKind::ArcTop => Direction::Short,
        }
    }
}

/// A trading signal. Emitted at most once per edge by the signal engine.
///
/// Arc signals additionally carry the second-most-extreme EMA5 value of the
/// detection window, which the position controller uses for its staleness
/// guard.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub timestamp: DateTime<Utc>,
    pub reference_price: f64,
    pub second_extreme: Option<f64>,
}

/// Position direction on a derivatives venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1 for long, -1 for short; multiplies price deltas into signed PnL.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    /// Order side that opens a position in this direction.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position held in this direction.
    pub fn exit_side(&self) -> OrderSide {
        self.opposite().entry_side()
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Position lifecycle. `Opening` and `Closing` are pending-confirmation
/// states: no new transition is accepted until the in-flight order call
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionPhase {
    Flat,
    Opening,
    Open,
    Closing,
}

/// The single position tracked per symbol session.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub phase: PositionPhase,
    pub direction: Option<Direction>,
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: u32,
}

impl Position {
    pub fn flat(leverage: u32) -> Self {
        Self {
            phase: PositionPhase::Flat,
            direction: None,
            qty: 0.0,
            entry_price: 0.0,
            leverage,
        }
    }

    /// True while an order acknowledgment is outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(self.phase, PositionPhase::Opening | PositionPhase::Closing)
    }
}

/// Futures account balance snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountBalance {
    pub available: f64,
    pub margin: f64,
    pub unrealized_profit: f64,
}

/// Exchange-declared trading rules for an instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentRules {
    /// Number of decimal places quantities are quoted in.
    pub quantity_precision: u32,
    /// Minimum tradable quantity.
    pub min_qty: f64,
}

/// Acknowledgment returned by the exchange for a placed order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: u64,
}
