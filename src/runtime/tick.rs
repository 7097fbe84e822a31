//! Tick decision/execution loop
//!
//! One call per closed execution candle. Guarded exits (stop-loss /
//! take-profit, then trailing stop) run before the strategy; a guarded exit
//! skips the strategy for that tick. The sequence is identical in every
//! execution mode.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::fingerprint::StrategyRuntimeFingerprints;
use super::snapshot::TickSnapshot;
use crate::execution::{
    ExecutionContext, ExecutionProvider, ExecutionResult, PaperAccountSnapshot,
    PaperPositionSnapshot, PositionUpdate,
};
use crate::risk::{RiskManager, TradePlan};
use crate::strategy::{DecisionContext, IntentAction, TradeIntent, TraderStrategy};
use crate::types::{unrealized_pnl, Candle, PositionSide};

/// Trailing stop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingConfig {
    pub enabled: bool,
    /// Move from entry needed before trailing starts (0.01 = 1%)
    pub activation_pct: f64,
    /// Distance of the stop behind the peak/trough (0.005 = 0.5%)
    pub trail_pct: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_pct: 0.01,
            trail_pct: 0.005,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::StopLoss => write!(f, "STOP_LOSS"),
            ExitKind::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitKind::TrailingStop => write!(f, "TRAILING_STOP"),
        }
    }
}

/// What drove the tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPath {
    GuardedExit(ExitKind),
    Strategy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickOutcome {
    pub timestamp: i64,
    pub path: TickPath,
    pub intent: Option<TradeIntent>,
    pub plan: Option<TradePlan>,
    pub execution: Option<ExecutionResult>,
    /// Reason code when nothing was executed
    pub skip_reason: Option<String>,
    pub position: PaperPositionSnapshot,
    pub account: Option<PaperAccountSnapshot>,
    /// Equity after the tick; fallback for the next one
    pub equity: f64,
}

/// SL/TP crossed by the candle, with the trigger level as fill price.
/// A candle crossing both counts as a stop-loss.
pub fn check_forced_exit(position: &PaperPositionSnapshot, candle: &Candle) -> Option<(ExitKind, f64)> {
    if !position.is_open() {
        return None;
    }
    let (sl_hit, tp_hit) = match position.side {
        PositionSide::Long => (
            position.stop_loss_price.filter(|sl| candle.low <= *sl),
            position.take_profit_price.filter(|tp| candle.high >= *tp),
        ),
        PositionSide::Short => (
            position.stop_loss_price.filter(|sl| candle.high >= *sl),
            position.take_profit_price.filter(|tp| candle.low <= *tp),
        ),
        PositionSide::Flat => return None,
    };

    sl_hit
        .map(|sl| (ExitKind::StopLoss, sl))
        .or_else(|| tp_hit.map(|tp| (ExitKind::TakeProfit, tp)))
}

/// Result of advancing the trailing stop by one close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStep {
    pub peak_price: f64,
    pub trough_price: f64,
    pub trailing_stop_price: Option<f64>,
    pub is_trailing_active: bool,
    pub triggered: bool,
}

impl TrailingStep {
    fn as_update(&self) -> PositionUpdate {
        PositionUpdate {
            peak_price: Some(self.peak_price),
            trough_price: Some(self.trough_price),
            trailing_stop_price: self.trailing_stop_price,
            is_trailing_active: Some(self.is_trailing_active),
        }
    }
}

/// Advance peak/trough, activation and the trailing stop using `close`.
///
/// Activation is sticky. The stop only ever tightens: up for longs, down
/// for shorts.
pub fn step_trailing(position: &PaperPositionSnapshot, close: f64, cfg: &TrailingConfig) -> TrailingStep {
    let entry = position.avg_entry_price;
    let peak = position.peak_price.max(close);
    let trough = if position.trough_price > 0.0 {
        position.trough_price.min(close)
    } else {
        close
    };

    let mut active = position.is_trailing_active;
    let mut stop = position.trailing_stop_price;
    let mut triggered = false;

    match position.side {
        PositionSide::Long => {
            if !active && close >= entry * (1.0 + cfg.activation_pct) {
                active = true;
            }
            if active {
                let candidate = peak * (1.0 - cfg.trail_pct);
                let tightened = stop.map_or(candidate, |s| s.max(candidate));
                stop = Some(tightened);
                triggered = close <= tightened;
            }
        }
        PositionSide::Short => {
            if !active && close <= entry * (1.0 - cfg.activation_pct) {
                active = true;
            }
            if active {
                let candidate = trough * (1.0 + cfg.trail_pct);
                let tightened = stop.map_or(candidate, |s| s.min(candidate));
                stop = Some(tightened);
                triggered = close >= tightened;
            }
        }
        PositionSide::Flat => {}
    }

    TrailingStep {
        peak_price: peak,
        trough_price: trough,
        trailing_stop_price: stop,
        is_trailing_active: active,
        triggered,
    }
}

/// Reason code if `plan` must not reach the execution provider.
pub fn pre_execution_skip(plan: &TradePlan, position: &PaperPositionSnapshot) -> Option<&'static str> {
    if !(plan.quantity > 0.0) {
        return Some("invalid_quantity");
    }
    match plan.action {
        IntentAction::Open if !position.side.is_flat() => {
            if position.side == plan.position_side {
                Some("position_already_open")
            } else {
                Some("opposite_position_open")
            }
        }
        IntentAction::Close if position.side != plan.position_side || !(position.size > 0.0) => {
            Some("no_position_to_close")
        }
        IntentAction::Hold => Some("hold"),
        _ => None,
    }
}

pub struct TickEngine {
    symbol: String,
    strategy: Arc<dyn TraderStrategy>,
    risk: Arc<dyn RiskManager>,
    execution: Arc<dyn ExecutionProvider>,
    trailing: TrailingConfig,
    fingerprints: StrategyRuntimeFingerprints,
}

impl TickEngine {
    pub fn new(
        symbol: &str,
        strategy: Arc<dyn TraderStrategy>,
        risk: Arc<dyn RiskManager>,
        execution: Arc<dyn ExecutionProvider>,
        trailing: TrailingConfig,
        fingerprints: StrategyRuntimeFingerprints,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            strategy,
            risk,
            execution,
            trailing,
            fingerprints,
        }
    }

    pub fn fingerprints(&self) -> &StrategyRuntimeFingerprints {
        &self.fingerprints
    }

    fn equity_at(&self, position: &PaperPositionSnapshot, price: f64, fallback: f64) -> (Option<PaperAccountSnapshot>, f64) {
        let unrealized = unrealized_pnl(position.side, position.avg_entry_price, position.size, price);
        let account = self.execution.snapshot_account(unrealized);
        let equity = account.as_ref().map(|a| a.equity).unwrap_or(fallback);
        (account, equity)
    }

    /// Run one tick. Never fails: execution problems become skip records.
    pub async fn run_tick(&self, snapshot: &TickSnapshot, fallback_equity: f64) -> TickOutcome {
        let candle = &snapshot.execution_candle;
        let ts = candle.timestamp;
        let position = self.execution.get_position(&self.symbol);
        let (_, equity) = self.equity_at(&position, candle.close, fallback_equity);

        let mut outcome = TickOutcome {
            timestamp: ts,
            path: TickPath::Strategy,
            intent: None,
            plan: None,
            execution: None,
            skip_reason: None,
            position: position.clone(),
            account: None,
            equity,
        };

        if let Some((kind, level)) = check_forced_exit(&position, candle) {
            info!(
                event = "forced_exit",
                symbol = %self.symbol,
                ts,
                exit = %kind,
                side = %position.side,
                level,
                "🛑 Guarded exit triggered"
            );
            outcome.path = TickPath::GuardedExit(kind);
            let intent = TradeIntent::close(position.side, kind.to_string()).stamped(&self.fingerprints);
            self.plan_and_execute(intent, level, equity, &position, ts, &mut outcome)
                .await;
        } else if self.trailing.enabled && position.is_open() {
            let step = step_trailing(&position, candle.close, &self.trailing);
            self.execution.update_position(&self.symbol, step.as_update());

            if step.triggered {
                info!(
                    event = "trailing_exit",
                    symbol = %self.symbol,
                    ts,
                    side = %position.side,
                    close = candle.close,
                    trailing_stop = ?step.trailing_stop_price,
                    "📉 Trailing stop hit"
                );
                outcome.path = TickPath::GuardedExit(ExitKind::TrailingStop);
                let intent = TradeIntent::close(position.side, ExitKind::TrailingStop.to_string())
                    .stamped(&self.fingerprints);
                let position = self.execution.get_position(&self.symbol);
                self.plan_and_execute(intent, candle.close, equity, &position, ts, &mut outcome)
                    .await;
            } else {
                self.consult_strategy(snapshot, equity, &mut outcome).await;
            }
        } else {
            self.consult_strategy(snapshot, equity, &mut outcome).await;
        }

        let position = self.execution.get_position(&self.symbol);
        let (account, equity) = self.equity_at(&position, candle.close, equity);
        outcome.position = position;
        outcome.account = account;
        outcome.equity = equity;

        debug!(
            event = "tick_completed",
            symbol = %self.symbol,
            ts,
            path = ?outcome.path,
            side = %outcome.position.side,
            equity = outcome.equity,
            skip_reason = ?outcome.skip_reason,
            "Tick completed"
        );
        outcome
    }

    async fn consult_strategy(&self, snapshot: &TickSnapshot, equity: f64, outcome: &mut TickOutcome) {
        let candle = &snapshot.execution_candle;
        let position = self.execution.get_position(&self.symbol);
        let ctx = DecisionContext {
            snapshot,
            position: &position,
            equity,
        };
        let history = snapshot.candles(snapshot.execution_timeframe);

        let intent = match self.strategy.decide(history, position.side, &ctx).await {
            Ok(intent) => intent.stamped(&self.fingerprints),
            Err(e) => {
                warn!(
                    event = "strategy_failed",
                    symbol = %self.symbol,
                    ts = candle.timestamp,
                    strategy = self.strategy.id(),
                    error = %e,
                    "Strategy decide failed, skipping tick"
                );
                outcome.skip_reason = Some("strategy_failed".to_string());
                return;
            }
        };

        if intent.action == IntentAction::Hold {
            outcome.skip_reason = Some("hold".to_string());
            outcome.intent = Some(intent);
            return;
        }

        info!(
            event = "strategy_intent",
            symbol = %self.symbol,
            ts = candle.timestamp,
            action = %intent.action,
            side = %intent.side,
            reason = %intent.reason,
            strategy_config_fingerprint = %self.fingerprints.strategy_config_fingerprint,
            runtime_context_fingerprint = %self.fingerprints.runtime_context_fingerprint,
            "🧭 Strategy intent"
        );
        self.plan_and_execute(intent, candle.close, equity, &position, candle.timestamp, outcome)
            .await;
    }

    async fn plan_and_execute(
        &self,
        intent: TradeIntent,
        price: f64,
        equity: f64,
        position: &PaperPositionSnapshot,
        ts: i64,
        outcome: &mut TickOutcome,
    ) {
        let plan = self.risk.plan(&intent, price, equity, position);
        let action = intent.action;
        outcome.intent = Some(intent);

        let Some(plan) = plan else {
            let reason = if action == IntentAction::Close {
                "no_position_to_close"
            } else {
                "risk_plan_rejected"
            };
            info!(
                event = reason,
                symbol = %self.symbol,
                ts,
                action = %action,
                price,
                equity,
                strategy_config_fingerprint = %self.fingerprints.strategy_config_fingerprint,
                runtime_context_fingerprint = %self.fingerprints.runtime_context_fingerprint,
                "Risk manager produced no plan"
            );
            outcome.skip_reason = Some(reason.to_string());
            return;
        };

        if let Some(reason) = pre_execution_skip(&plan, position) {
            info!(
                event = "execution_skipped",
                symbol = %self.symbol,
                ts,
                reason,
                action = %plan.action,
                side = %plan.position_side,
                "Plan skipped before execution"
            );
            outcome.skip_reason = Some(reason.to_string());
            outcome.plan = Some(plan);
            return;
        }

        let ctx = ExecutionContext { price, timestamp: ts };
        match self.execution.execute(&self.symbol, &plan, ctx).await {
            Ok(result) => {
                if !result.is_filled() {
                    info!(
                        event = "execution_skipped",
                        symbol = %self.symbol,
                        ts,
                        reason = ?result.reason,
                        "Execution provider skipped plan"
                    );
                    outcome.skip_reason = result.reason.clone();
                }
                outcome.execution = Some(result);
            }
            Err(e) => {
                error!(
                    event = "execution_failed",
                    symbol = %self.symbol,
                    ts,
                    action = %plan.action,
                    side = %plan.position_side,
                    error = %e,
                    "❌ Execution failed"
                );
                outcome.skip_reason = Some("execution_failed".to_string());
            }
        }
        outcome.plan = Some(plan);
    }
}
