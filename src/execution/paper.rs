//! Paper execution engine
//!
//! Simulates fills at the tick price against an in-memory position map and
//! account ledger. In live mode, plans are sent to the exchange as market
//! orders and the ledger is left alone.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::account::{ClosedTrade, PaperAccount, PaperAccountSnapshot};
use super::{
    ExecutionContext, ExecutionProvider, ExecutionResult, ExecutionStatus, MarketOrderRequest,
    OrderClient, OrderSide, PaperPositionSnapshot, PositionUpdate,
};
use crate::risk::TradePlan;
use crate::strategy::IntentAction;
use crate::types::{unrealized_pnl, ExecutionMode, PositionSide};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperConfig {
    pub initial_balance: f64,
    /// Charged on entry and exit notional
    pub fee_bps: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            fee_bps: 0.0,
        }
    }
}

pub struct PaperExecutionEngine {
    mode: ExecutionMode,
    config: PaperConfig,
    positions: RwLock<HashMap<String, PaperPositionSnapshot>>,
    account: RwLock<PaperAccount>,
    order_client: Option<Arc<dyn OrderClient>>,
}

impl PaperExecutionEngine {
    pub fn new(mode: ExecutionMode, config: PaperConfig) -> Self {
        let account = PaperAccount::new(config.initial_balance);
        Self {
            mode,
            config,
            positions: RwLock::new(HashMap::new()),
            account: RwLock::new(account),
            order_client: None,
        }
    }

    pub fn with_order_client(mut self, client: Arc<dyn OrderClient>) -> Self {
        self.order_client = Some(client);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn fee(&self, notional: f64) -> f64 {
        notional.abs() * self.config.fee_bps / 10_000.0
    }

    fn open(&self, symbol: &str, plan: &TradePlan, ctx: ExecutionContext) -> ExecutionResult {
        let mut positions = self.positions.write().unwrap_or_else(|p| p.into_inner());
        let position = positions.entry(symbol.to_string()).or_default();

        if !position.side.is_flat() {
            return ExecutionResult::skipped("position_already_open");
        }
        if plan.position_side.is_flat() || !(plan.quantity > 0.0) || !(ctx.price > 0.0) {
            return ExecutionResult::skipped("invalid_quantity");
        }

        let price = ctx.price;
        *position = PaperPositionSnapshot {
            side: plan.position_side,
            size: plan.quantity,
            entry_price: price,
            avg_entry_price: price,
            realized_pnl: position.realized_pnl,
            peak_price: price,
            trough_price: price,
            trailing_stop_price: plan.stop_loss,
            is_trailing_active: false,
            stop_loss_price: plan.stop_loss,
            take_profit_price: plan.take_profit,
            entry_fee: self.fee(price * plan.quantity),
        };

        info!(
            symbol,
            side = %plan.position_side,
            quantity = plan.quantity,
            price,
            stop_loss = ?plan.stop_loss,
            take_profit = ?plan.take_profit,
            "📈 Paper position opened"
        );

        ExecutionResult {
            status: ExecutionStatus::Filled,
            reason: None,
            fill_price: Some(price),
            quantity: plan.quantity,
            realized_pnl: None,
            order_id: None,
        }
    }

    fn close(&self, symbol: &str, plan: &TradePlan, ctx: ExecutionContext) -> ExecutionResult {
        let price = ctx.price;
        let (closed, realized, fees) = {
            let mut positions = self.positions.write().unwrap_or_else(|p| p.into_inner());
            let position = positions.entry(symbol.to_string()).or_default();

            if position.side != plan.position_side || !(position.size > 0.0) {
                return ExecutionResult::skipped("no_position_to_close");
            }
            let closed = std::mem::take(position);

            let gross = unrealized_pnl(closed.side, closed.avg_entry_price, closed.size, price);
            let fees = closed.entry_fee + self.fee(price * closed.size);
            let realized = gross - fees;
            position.realized_pnl = closed.realized_pnl + realized;
            (closed, realized, fees)
        };

        self.account
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .register_close(ClosedTrade {
                symbol: symbol.to_string(),
                side: closed.side,
                quantity: closed.size,
                entry_price: closed.avg_entry_price,
                exit_price: price,
                realized_pnl: realized,
                fees,
                closed_at: ctx.timestamp,
            });

        let emoji = if realized > 0.0 { "✅" } else { "❌" };
        info!(
            symbol,
            side = %closed.side,
            entry = closed.avg_entry_price,
            exit = price,
            pnl = realized,
            fees,
            "{} Paper position closed",
            emoji
        );

        ExecutionResult {
            status: ExecutionStatus::Filled,
            reason: None,
            fill_price: Some(price),
            quantity: closed.size,
            realized_pnl: Some(realized),
            order_id: None,
        }
    }

    async fn submit_live(
        &self,
        symbol: &str,
        plan: &TradePlan,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult> {
        let client = self
            .order_client
            .as_ref()
            .context("Live execution requires an order client")?;

        let (side, reduce_only) = match (plan.action, plan.position_side) {
            (IntentAction::Open, PositionSide::Long) => (OrderSide::Buy, false),
            (IntentAction::Open, PositionSide::Short) => (OrderSide::Sell, false),
            (IntentAction::Close, PositionSide::Short) => (OrderSide::Buy, true),
            (IntentAction::Close, PositionSide::Long) => (OrderSide::Sell, true),
            _ => return Ok(ExecutionResult::skipped("unsupported_plan")),
        };

        let order = MarketOrderRequest {
            symbol: symbol.to_string(),
            side,
            quantity: plan.quantity,
            reduce_only,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        };

        let fill = client
            .submit_market_order(&order)
            .await
            .with_context(|| format!("Market order {} {} failed", order.side, symbol))?;

        let fill_price = fill.avg_price.filter(|p| *p > 0.0).unwrap_or(ctx.price);
        info!(
            symbol,
            side = %order.side,
            quantity = order.quantity,
            reduce_only,
            order_id = %fill.order_id,
            fill_price,
            "🚀 Live market order filled"
        );

        Ok(ExecutionResult {
            status: ExecutionStatus::Filled,
            reason: None,
            fill_price: Some(fill_price),
            quantity: fill.filled_quantity,
            realized_pnl: None,
            order_id: Some(fill.order_id),
        })
    }
}

#[async_trait]
impl ExecutionProvider for PaperExecutionEngine {
    fn get_position(&self, symbol: &str) -> PaperPositionSnapshot {
        self.positions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    fn update_position(&self, symbol: &str, update: PositionUpdate) {
        let mut positions = self.positions.write().unwrap_or_else(|p| p.into_inner());
        let Some(position) = positions.get_mut(symbol) else {
            warn!(symbol, "Position update for unknown symbol ignored");
            return;
        };
        if let Some(peak) = update.peak_price {
            position.peak_price = peak;
        }
        if let Some(trough) = update.trough_price {
            position.trough_price = trough;
        }
        if let Some(stop) = update.trailing_stop_price {
            position.trailing_stop_price = Some(stop);
        }
        if let Some(active) = update.is_trailing_active {
            position.is_trailing_active = active;
        }
    }

    fn snapshot_account(&self, unrealized_pnl: f64) -> Option<PaperAccountSnapshot> {
        Some(
            self.account
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .snapshot(unrealized_pnl),
        )
    }

    async fn execute(
        &self,
        symbol: &str,
        plan: &TradePlan,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult> {
        if self.mode == ExecutionMode::Live {
            return self.submit_live(symbol, plan, ctx).await;
        }

        Ok(match plan.action {
            IntentAction::Open => self.open(symbol, plan, ctx),
            IntentAction::Close => self.close(symbol, plan, ctx),
            IntentAction::Hold => ExecutionResult::skipped("hold"),
        })
    }
}
