//! Typed errors for the conditions callers branch on.

use thiserror::Error;

use crate::types::Timeframe;

/// Startup configuration problems. These are the only fatal errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid timeframe label: {0}")]
    InvalidTimeframe(String),

    #[error("unknown execution mode: {0}")]
    UnknownMode(String),

    #[error("no timeframes requested")]
    NoTimeframes,

    #[error("execution timeframe {0} is not in the requested timeframe set")]
    ExecutionTimeframeNotRequested(Timeframe),

    #[error("unknown market data source: {0}")]
    UnknownSource(String),

    #[error("strategy id is not registered: {0}")]
    UnknownStrategy(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("live mode requires an exchange order client")]
    MissingOrderClient,
}

/// Market data plant lifecycle errors.
#[derive(Debug, Error)]
pub enum PlantError {
    #[error("market data plant already started")]
    AlreadyStarted,

    #[error("market data plant requires at least one timeframe")]
    NoTimeframes,

    #[error("bootstrap of {timeframe} history failed: {source}")]
    Bootstrap {
        timeframe: Timeframe,
        #[source]
        source: anyhow::Error,
    },

    #[error("base candle source failed to start: {0}")]
    Source(#[source] anyhow::Error),
}

/// Tick snapshot construction errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(
        "execution candle at {timestamp} is misaligned to {timeframe} by {offset_ms}ms \
         (expected bucket start {expected})"
    )]
    Misaligned {
        timeframe: Timeframe,
        timestamp: i64,
        expected: i64,
        offset_ms: i64,
    },

    #[error("execution candle timeframe {candle} does not match execution timeframe {expected}")]
    TimeframeMismatch {
        candle: Timeframe,
        expected: Timeframe,
    },
}
