//! Market data module - base candle ingestion and multi-timeframe aggregation
//!
//! A [`MarketDataPlant`] streams one base timeframe from a
//! [`BaseCandleSource`](sources::BaseCandleSource), repairs gaps over REST and
//! derives every higher timeframe by aggregation.

pub mod aggregation;
pub mod buffer;
pub mod bus;
pub mod client;
pub mod gap_repair;
pub mod plant;
pub mod sources;

pub use aggregation::{aggregate_candle, aggregate_newly_closed, detect_closed_buckets, ClosedBucket};
pub use buffer::{CandleBuffer, CandleHistoryView};
pub use bus::{CandleEventBus, CandleEventHandler, Subscription};
pub use client::{BinanceRestClient, HistoricalCandleClient, MarketDataClient, BINANCE_FUTURES_REST_URL};
pub use gap_repair::{repair_candle_gap, GapRepairResult};
pub use plant::{MarketDataPlant, PlantConfig, PlantState};
