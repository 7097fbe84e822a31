//! PerpBot Library
//!
//! Closed-candle market data plant and tick execution loop for crypto
//! futures trading

pub mod config;
pub mod error;
pub mod execution;
pub mod market_data;
pub mod risk;
pub mod runtime;
pub mod strategy;
pub mod types;

pub use config::AppConfig;
pub use error::{ConfigError, PlantError, SnapshotError};
pub use market_data::{MarketDataPlant, PlantConfig, PlantState};
pub use runtime::{TickEngine, TraderRuntime};
pub use types::{Candle, ClosedCandleEvent, ExecutionMode, PositionSide, Timeframe};
