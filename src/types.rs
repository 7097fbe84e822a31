//! Core types used throughout PerpBot
//!
//! Defines timeframes, candles, closed-candle events and position sides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Candle timeframe, stored as its bucket duration in milliseconds.
///
/// Ordering follows duration, so the smallest timeframe of a set is its
/// `min()`. Serialized as its exchange label (`1m`, `15m`, `4h`, `1d`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    ms: i64,
}

impl Timeframe {
    pub const M1: Timeframe = Timeframe { ms: MINUTE_MS };
    pub const M5: Timeframe = Timeframe { ms: 5 * MINUTE_MS };
    pub const M15: Timeframe = Timeframe { ms: 15 * MINUTE_MS };
    pub const H1: Timeframe = Timeframe { ms: HOUR_MS };
    pub const H4: Timeframe = Timeframe { ms: 4 * HOUR_MS };
    pub const D1: Timeframe = Timeframe { ms: DAY_MS };

    /// Build a timeframe from a positive millisecond duration.
    pub fn from_millis(ms: i64) -> Option<Self> {
        (ms > 0).then_some(Self { ms })
    }

    /// Bucket duration in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.ms
    }

    /// Floor a timestamp to the start of its bucket.
    pub fn bucket_start(&self, ts: i64) -> i64 {
        ts.div_euclid(self.ms) * self.ms
    }

    /// Whether `ts` sits exactly on a bucket boundary.
    pub fn is_aligned(&self, ts: i64) -> bool {
        ts.rem_euclid(self.ms) == 0
    }

    /// Exchange label, e.g. `5m` or `4h`.
    pub fn label(&self) -> String {
        let ms = self.ms;
        if ms % WEEK_MS == 0 {
            format!("{}w", ms / WEEK_MS)
        } else if ms % DAY_MS == 0 {
            format!("{}d", ms / DAY_MS)
        } else if ms % HOUR_MS == 0 {
            format!("{}h", ms / HOUR_MS)
        } else if ms % MINUTE_MS == 0 {
            format!("{}m", ms / MINUTE_MS)
        } else {
            format!("{}ms", ms)
        }
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        let invalid = || ConfigError::InvalidTimeframe(s.to_string());

        let split = label
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (count, unit) = label.split_at(split);
        let count: i64 = count.parse().map_err(|_| invalid())?;

        let unit_ms = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => MINUTE_MS,
            "h" | "H" => HOUR_MS,
            "d" | "D" => DAY_MS,
            "w" | "W" => WEEK_MS,
            _ => return Err(invalid()),
        };

        count
            .checked_mul(unit_ms)
            .and_then(Timeframe::from_millis)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.label()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Closed OHLCV bar. `timestamp` is the bucket start in UTC epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Exclusive end of the candle's bucket.
    pub fn close_time(&self) -> i64 {
        self.timestamp + self.timeframe.duration_ms()
    }
}

/// Where a closed candle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleSource {
    Ws,
    Rest,
    Poll,
}

impl fmt::Display for CandleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandleSource::Ws => write!(f, "ws"),
            CandleSource::Rest => write!(f, "rest"),
            CandleSource::Poll => write!(f, "poll"),
        }
    }
}

/// Arrival metadata attached by a base candle source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleMeta {
    /// Local receive time (epoch millis)
    pub received_at: i64,
    pub source: CandleSource,
}

/// Emitted exactly once per (symbol, timeframe, timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedCandleEvent {
    pub venue: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candle: Candle,
    pub arrival_delay_ms: i64,
    pub gap_filled: bool,
    pub source: CandleSource,
}

/// Position direction, including flat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    #[default]
    Flat,
}

impl PositionSide {
    pub fn is_flat(&self) -> bool {
        matches!(self, PositionSide::Flat)
    }

    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
            PositionSide::Flat => PositionSide::Flat,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
            PositionSide::Flat => write!(f, "FLAT"),
        }
    }
}

/// Execution mode. Behavior of the tick loop is identical across all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Backtest,
    Paper,
    Live,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backtest" => Ok(ExecutionMode::Backtest),
            "paper" => Ok(ExecutionMode::Paper),
            "live" => Ok(ExecutionMode::Live),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Backtest => write!(f, "backtest"),
            ExecutionMode::Paper => write!(f, "paper"),
            ExecutionMode::Live => write!(f, "live"),
        }
    }
}

/// Unrealized PnL of a position marked at `price`.
pub fn unrealized_pnl(side: PositionSide, avg_entry: f64, size: f64, price: f64) -> f64 {
    if avg_entry <= 0.0 || size <= 0.0 {
        return 0.0;
    }
    match side {
        PositionSide::Long => (price - avg_entry) * size,
        PositionSide::Short => (avg_entry - price) * size,
        PositionSide::Flat => 0.0,
    }
}
