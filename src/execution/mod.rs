//! Execution - position ledger, account bookkeeping and order submission
//!
//! [`ExecutionProvider`] is what the tick loop talks to. The paper engine
//! keeps positions and the account in memory; in live mode it forwards plans
//! to an [`OrderClient`] instead.

mod account;
mod paper;

pub use account::{ClosedTrade, PaperAccount, PaperAccountSnapshot, TradeCounters};
pub use paper::{PaperConfig, PaperExecutionEngine};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::risk::TradePlan;
use crate::types::PositionSide;

/// Per-symbol position state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PaperPositionSnapshot {
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub avg_entry_price: f64,
    /// Net PnL of every position closed on this symbol, kept while flat
    pub realized_pnl: f64,
    /// Highest close since open
    pub peak_price: f64,
    /// Lowest close since open
    pub trough_price: f64,
    pub trailing_stop_price: Option<f64>,
    pub is_trailing_active: bool,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    /// Entry fee, charged against realized PnL on close
    pub entry_fee: f64,
}

impl PaperPositionSnapshot {
    pub fn is_open(&self) -> bool {
        !self.side.is_flat() && self.size > 0.0
    }
}

/// Narrow update of the trailing-stop fields.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionUpdate {
    pub peak_price: Option<f64>,
    pub trough_price: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub is_trailing_active: Option<bool>,
}

/// Market data for the fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionContext {
    pub price: f64,
    /// Candle timestamp of the tick
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Filled,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub reason: Option<String>,
    pub fill_price: Option<f64>,
    pub quantity: f64,
    pub realized_pnl: Option<f64>,
    pub order_id: Option<String>,
}

impl ExecutionResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            reason: Some(reason.into()),
            fill_price: None,
            quantity: 0.0,
            realized_pnl: None,
            order_id: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status == ExecutionStatus::Filled
    }
}

/// Venue adapter used by the tick loop.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    /// Current position; FLAT if the symbol was never traded.
    fn get_position(&self, symbol: &str) -> PaperPositionSnapshot;

    fn update_position(&self, symbol: &str, update: PositionUpdate);

    /// Account state with `unrealized_pnl` marked in, if the provider keeps one.
    fn snapshot_account(&self, unrealized_pnl: f64) -> Option<PaperAccountSnapshot>;

    async fn execute(
        &self,
        symbol: &str,
        plan: &TradePlan,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub reduce_only: bool,
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub avg_price: Option<f64>,
    pub filled_quantity: f64,
}

/// Exchange order entry for live mode.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderClient: Send + Sync {
    async fn submit_market_order(&self, order: &MarketOrderRequest) -> Result<OrderFill>;
}
