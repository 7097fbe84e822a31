//! Strategy seam - trade intents from candle history
//!
//! Strategies are looked up by id in a [`StrategyRegistry`]. Two reference
//! strategies ship: `hold` (never trades) and `sma_cross`.

mod sma_cross;

pub use sma_cross::{SmaCrossParams, SmaCrossStrategy};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::execution::PaperPositionSnapshot;
use crate::runtime::fingerprint::StrategyRuntimeFingerprints;
use crate::runtime::snapshot::TickSnapshot;
use crate::types::{Candle, PositionSide};

/// What a strategy wants done this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentAction {
    Open,
    Close,
    Hold,
}

impl fmt::Display for IntentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentAction::Open => write!(f, "OPEN"),
            IntentAction::Close => write!(f, "CLOSE"),
            IntentAction::Hold => write!(f, "HOLD"),
        }
    }
}

/// Strategy output. `side` is the position side the action applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub action: IntentAction,
    pub side: PositionSide,
    pub reason: String,
    /// Optional protective levels; the risk manager fills in defaults
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy_config_fingerprint: Option<String>,
    pub runtime_context_fingerprint: Option<String>,
}

impl TradeIntent {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self::new(IntentAction::Hold, PositionSide::Flat, reason)
    }

    pub fn open(side: PositionSide, reason: impl Into<String>) -> Self {
        Self::new(IntentAction::Open, side, reason)
    }

    pub fn close(side: PositionSide, reason: impl Into<String>) -> Self {
        Self::new(IntentAction::Close, side, reason)
    }

    fn new(action: IntentAction, side: PositionSide, reason: impl Into<String>) -> Self {
        Self {
            action,
            side,
            reason: reason.into(),
            stop_loss: None,
            take_profit: None,
            strategy_config_fingerprint: None,
            runtime_context_fingerprint: None,
        }
    }

    /// Attach the runtime fingerprints.
    pub fn stamped(mut self, fingerprints: &StrategyRuntimeFingerprints) -> Self {
        self.strategy_config_fingerprint = Some(fingerprints.strategy_config_fingerprint.clone());
        self.runtime_context_fingerprint = Some(fingerprints.runtime_context_fingerprint.clone());
        self
    }
}

/// Read-only context handed to [`TraderStrategy::decide`].
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub snapshot: &'a TickSnapshot,
    pub position: &'a PaperPositionSnapshot,
    pub equity: f64,
}

/// Decides what to do on each closed execution candle.
#[async_trait]
pub trait TraderStrategy: Send + Sync {
    /// Registry id
    fn id(&self) -> &str;

    /// Parameters as JSON, used for fingerprinting
    fn params(&self) -> serde_json::Value;

    /// `candles` is the execution timeframe history, oldest first, ending
    /// with the candle that just closed.
    async fn decide(
        &self,
        candles: &[Candle],
        position: PositionSide,
        ctx: &DecisionContext<'_>,
    ) -> Result<TradeIntent>;
}

/// Never trades.
#[derive(Debug, Default)]
pub struct HoldStrategy;

#[async_trait]
impl TraderStrategy for HoldStrategy {
    fn id(&self) -> &str {
        "hold"
    }

    fn params(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    async fn decide(
        &self,
        _candles: &[Candle],
        _position: PositionSide,
        _ctx: &DecisionContext<'_>,
    ) -> Result<TradeIntent> {
        Ok(TradeIntent::hold("hold strategy"))
    }
}

type StrategyFactory = fn(&serde_json::Value) -> Result<Arc<dyn TraderStrategy>, ConfigError>;

/// Strategy id -> constructor
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("hold", |_| Ok(Arc::new(HoldStrategy)));
        registry.register("sma_cross", |params| {
            let params: SmaCrossParams = if params.is_null() {
                SmaCrossParams::default()
            } else {
                serde_json::from_value(params.clone()).map_err(|e| ConfigError::InvalidValue {
                    field: "strategy.params",
                    reason: e.to_string(),
                })?
            };
            Ok(Arc::new(SmaCrossStrategy::new(params)?))
        });
        registry
    }
}

impl StrategyRegistry {
    pub fn register(&mut self, id: &str, factory: StrategyFactory) {
        self.factories.insert(id.to_string(), factory);
    }

    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(
        &self,
        id: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn TraderStrategy>, ConfigError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| ConfigError::UnknownStrategy(id.to_string()))?;
        factory(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_builds_known_ids() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.ids(), vec!["hold", "sma_cross"]);
        assert_eq!(registry.build("hold", &serde_json::Value::Null).unwrap().id(), "hold");

        let sma = registry
            .build("sma_cross", &serde_json::json!({"fast": 3, "slow": 5}))
            .unwrap();
        assert_eq!(sma.params()["slow"], 5);
    }

    #[test]
    fn unknown_strategy_is_a_config_error() {
        let registry = StrategyRegistry::default();
        let err = registry.build("macd", &serde_json::Value::Null).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownStrategy(id) if id == "macd"));
    }

    #[test]
    fn bad_params_are_rejected() {
        let registry = StrategyRegistry::default();
        assert!(registry
            .build("sma_cross", &serde_json::json!({"fast": 10, "slow": 5}))
            .is_err());
        assert!(registry
            .build("sma_cross", &serde_json::json!({"fast": "x"}))
            .is_err());
    }

    #[test]
    fn stamping_copies_fingerprints() {
        let fp = StrategyRuntimeFingerprints {
            strategy_config_fingerprint: "a".to_string(),
            runtime_context_fingerprint: "b".to_string(),
        };
        let intent = TradeIntent::open(PositionSide::Long, "test").stamped(&fp);
        assert_eq!(intent.strategy_config_fingerprint.as_deref(), Some("a"));
        assert_eq!(intent.runtime_context_fingerprint.as_deref(), Some("b"));
    }
}
