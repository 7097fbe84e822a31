//! Simple moving average cross over the execution series

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DecisionContext, TradeIntent, TraderStrategy};
use crate::error::ConfigError;
use crate::types::{Candle, PositionSide};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmaCrossParams {
    pub fast: usize,
    pub slow: usize,
    /// Open shorts on a bearish cross when flat
    pub allow_short: bool,
}

impl Default for SmaCrossParams {
    fn default() -> Self {
        Self {
            fast: 9,
            slow: 21,
            allow_short: true,
        }
    }
}

/// Opens on a fresh cross when flat, closes on the opposite cross.
#[derive(Debug)]
pub struct SmaCrossStrategy {
    params: SmaCrossParams,
}

impl SmaCrossStrategy {
    pub fn new(params: SmaCrossParams) -> Result<Self, ConfigError> {
        if params.fast == 0 || params.fast >= params.slow {
            return Err(ConfigError::InvalidValue {
                field: "strategy.params",
                reason: format!(
                    "sma_cross needs 0 < fast < slow, got fast={} slow={}",
                    params.fast, params.slow
                ),
            });
        }
        Ok(Self { params })
    }
}

fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cross {
    Up,
    Down,
}

fn detect_cross(closes: &[f64], fast: usize, slow: usize) -> Option<Cross> {
    if closes.len() < slow + 1 {
        return None;
    }
    let prev = &closes[..closes.len() - 1];
    let (fast_now, slow_now) = (sma(closes, fast)?, sma(closes, slow)?);
    let (fast_prev, slow_prev) = (sma(prev, fast)?, sma(prev, slow)?);

    if fast_prev <= slow_prev && fast_now > slow_now {
        Some(Cross::Up)
    } else if fast_prev >= slow_prev && fast_now < slow_now {
        Some(Cross::Down)
    } else {
        None
    }
}

#[async_trait]
impl TraderStrategy for SmaCrossStrategy {
    fn id(&self) -> &str {
        "sma_cross"
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null)
    }

    async fn decide(
        &self,
        candles: &[Candle],
        position: PositionSide,
        _ctx: &DecisionContext<'_>,
    ) -> Result<TradeIntent> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let Some(cross) = detect_cross(&closes, self.params.fast, self.params.slow) else {
            return Ok(TradeIntent::hold("no cross"));
        };

        let intent = match (position, cross) {
            (PositionSide::Flat, Cross::Up) => TradeIntent::open(PositionSide::Long, "sma bullish cross"),
            (PositionSide::Flat, Cross::Down) if self.params.allow_short => {
                TradeIntent::open(PositionSide::Short, "sma bearish cross")
            }
            (PositionSide::Long, Cross::Down) => {
                TradeIntent::close(PositionSide::Long, "sma bearish cross")
            }
            (PositionSide::Short, Cross::Up) => {
                TradeIntent::close(PositionSide::Short, "sma bullish cross")
            }
            _ => TradeIntent::hold("cross agrees with position"),
        };
        Ok(intent)
    }
}
