//! Risk Manager - turns trade intents into sized trade plans
//!
//! Implements:
//! - Percent-of-equity position sizing against the stop distance
//! - Leverage cap on notional
//! - Default stop-loss and R-multiple take-profit levels
//! - Full-size close plans for the open position

use serde::{Deserialize, Serialize};

use crate::execution::PaperPositionSnapshot;
use crate::strategy::{IntentAction, TradeIntent};
use crate::types::PositionSide;

/// A risk-checked order the execution provider can act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePlan {
    pub action: IntentAction,
    /// Side of the position being opened or closed
    pub position_side: PositionSide,
    pub quantity: f64,
    /// Reference price the plan was sized at
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason: String,
}

/// Sizes intents. Returns `None` when the intent cannot be planned.
pub trait RiskManager: Send + Sync {
    fn plan(
        &self,
        intent: &TradeIntent,
        price: f64,
        equity: f64,
        position: &PaperPositionSnapshot,
    ) -> Option<TradePlan>;
}

/// Risk configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    /// Percent of equity lost if the stop is hit (1.0 = 1%)
    pub risk_per_trade_percent: f64,
    /// Stop distance used when the intent carries no stop (0.01 = 1%)
    pub default_stop_loss_pct: f64,
    /// Take-profit distance in multiples of the stop distance; 0 disables
    pub take_profit_r_multiple: f64,
    /// Notional cap as a multiple of equity
    pub max_leverage: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            risk_per_trade_percent: 1.0,
            default_stop_loss_pct: 0.01,
            take_profit_r_multiple: 2.0,
            max_leverage: 3.0,
        }
    }
}

/// Fixed fractional sizing: lose `risk_per_trade_percent` of equity at the stop.
#[derive(Debug, Clone)]
pub struct PercentRiskManager {
    settings: RiskSettings,
}

impl PercentRiskManager {
    pub fn new(settings: RiskSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RiskSettings {
        &self.settings
    }

    fn plan_open(&self, intent: &TradeIntent, price: f64, equity: f64) -> Option<TradePlan> {
        let direction = match intent.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
            PositionSide::Flat => return None,
        };

        let stop = intent
            .stop_loss
            .unwrap_or(price * (1.0 - direction * self.settings.default_stop_loss_pct));
        // Stop must sit on the losing side of entry
        let distance = (price - stop) * direction;
        if !(distance > 0.0) {
            return None;
        }

        let risk_budget = equity * self.settings.risk_per_trade_percent / 100.0;
        let by_risk = risk_budget / distance;
        let by_leverage = self.settings.max_leverage * equity / price;
        let quantity = by_risk.min(by_leverage);
        if !(quantity > 0.0) || !quantity.is_finite() {
            return None;
        }

        let take_profit = intent.take_profit.or_else(|| {
            (self.settings.take_profit_r_multiple > 0.0)
                .then(|| price + direction * self.settings.take_profit_r_multiple * distance)
        });

        Some(TradePlan {
            action: IntentAction::Open,
            position_side: intent.side,
            quantity,
            entry_price: price,
            stop_loss: Some(stop),
            take_profit,
            reason: intent.reason.clone(),
        })
    }

    fn plan_close(
        &self,
        intent: &TradeIntent,
        price: f64,
        position: &PaperPositionSnapshot,
    ) -> Option<TradePlan> {
        if position.side.is_flat() || position.side != intent.side || !(position.size > 0.0) {
            return None;
        }
        Some(TradePlan {
            action: IntentAction::Close,
            position_side: position.side,
            quantity: position.size,
            entry_price: price,
            stop_loss: None,
            take_profit: None,
            reason: intent.reason.clone(),
        })
    }
}

impl RiskManager for PercentRiskManager {
    fn plan(
        &self,
        intent: &TradeIntent,
        price: f64,
        equity: f64,
        position: &PaperPositionSnapshot,
    ) -> Option<TradePlan> {
        if !(price > 0.0) {
            return None;
        }
        match intent.action {
            IntentAction::Open if equity > 0.0 => self.plan_open(intent, price, equity),
            IntentAction::Open => None,
            IntentAction::Close => self.plan_close(intent, price, position),
            IntentAction::Hold => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PercentRiskManager {
        PercentRiskManager::new(RiskSettings {
            risk_per_trade_percent: 1.0,
            default_stop_loss_pct: 0.02,
            take_profit_r_multiple: 2.0,
            max_leverage: 10.0,
        })
    }

    fn long_position(size: f64) -> PaperPositionSnapshot {
        PaperPositionSnapshot {
            side: PositionSide::Long,
            size,
            entry_price: 100.0,
            avg_entry_price: 100.0,
            ..PaperPositionSnapshot::default()
        }
    }

    #[test]
    fn sizes_long_by_stop_distance() {
        let flat = PaperPositionSnapshot::default();
        let plan = manager()
            .plan(&TradeIntent::open(PositionSide::Long, "t"), 100.0, 10_000.0, &flat)
            .unwrap();
        // risk 100 over a 2.0 stop distance
        assert!((plan.quantity - 50.0).abs() < 1e-9);
        assert!((plan.stop_loss.unwrap() - 98.0).abs() < 1e-9);
        assert!((plan.take_profit.unwrap() - 104.0).abs() < 1e-9);
    }

    #[test]
    fn short_levels_are_mirrored() {
        let flat = PaperPositionSnapshot::default();
        let plan = manager()
            .plan(&TradeIntent::open(PositionSide::Short, "t"), 100.0, 10_000.0, &flat)
            .unwrap();
        assert!((plan.stop_loss.unwrap() - 102.0).abs() < 1e-9);
        assert!((plan.take_profit.unwrap() - 96.0).abs() < 1e-9);
    }

    #[test]
    fn leverage_caps_quantity() {
        let mgr = PercentRiskManager::new(RiskSettings {
            risk_per_trade_percent: 5.0,
            default_stop_loss_pct: 0.001,
            take_profit_r_multiple: 0.0,
            max_leverage: 2.0,
        });
        let plan = mgr
            .plan(
                &TradeIntent::open(PositionSide::Long, "t"),
                100.0,
                1_000.0,
                &PaperPositionSnapshot::default(),
            )
            .unwrap();
        assert!((plan.quantity - 20.0).abs() < 1e-9);
        assert!(plan.take_profit.is_none());
    }

    #[test]
    fn stop_on_wrong_side_is_rejected() {
        let mut intent = TradeIntent::open(PositionSide::Long, "t");
        intent.stop_loss = Some(101.0);
        assert!(manager()
            .plan(&intent, 100.0, 10_000.0, &PaperPositionSnapshot::default())
            .is_none());
    }

    #[test]
    fn close_plans_full_size_of_matching_side() {
        let plan = manager()
            .plan(&TradeIntent::close(PositionSide::Long, "t"), 110.0, 1.0, &long_position(3.0))
            .unwrap();
        assert_eq!(plan.quantity, 3.0);
        assert_eq!(plan.position_side, PositionSide::Long);

        assert!(manager()
            .plan(&TradeIntent::close(PositionSide::Short, "t"), 110.0, 1.0, &long_position(3.0))
            .is_none());
        assert!(manager()
            .plan(
                &TradeIntent::close(PositionSide::Long, "t"),
                110.0,
                1.0,
                &PaperPositionSnapshot::default()
            )
            .is_none());
    }

    #[test]
    fn non_positive_inputs_yield_no_plan() {
        let flat = PaperPositionSnapshot::default();
        let open = TradeIntent::open(PositionSide::Long, "t");
        assert!(manager().plan(&open, 0.0, 10_000.0, &flat).is_none());
        assert!(manager().plan(&open, 100.0, 0.0, &flat).is_none());
        assert!(manager().plan(&TradeIntent::hold("t"), 100.0, 10_000.0, &flat).is_none());
    }
}
