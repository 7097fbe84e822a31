//! Runtime fingerprints - content hashes proving two runs decide alike
//!
//! Configuration is canonicalized (keys sorted at every level, top-level
//! execution-mode and windowing fields removed) and hashed with SHA-256. A backtest and a
//! paper run over the same strategy, risk and venue settings produce the same
//! pair of fingerprints.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::strategy::TraderStrategy;
use crate::types::{ExecutionMode, Timeframe};

/// Top-level context keys that differ between modes or runs without
/// changing decisions. Nested values, strategy params included, keep them.
const VOLATILE_KEYS: &[&str] = &[
    "mode",
    "execution_mode",
    "dry_run",
    "window_start",
    "window_end",
    "start_time",
    "end_time",
    "backtest",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRuntimeFingerprints {
    pub strategy_config_fingerprint: String,
    pub runtime_context_fingerprint: String,
}

/// Startup record logged by the binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSnapshot {
    pub mode: ExecutionMode,
    pub venue: String,
    pub symbol: String,
    pub timeframes: Vec<Timeframe>,
    pub execution_timeframe: Timeframe,
    pub strategy_id: String,
    pub fingerprints: StrategyRuntimeFingerprints,
}

/// Rebuild objects in sorted key order, recursively.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Drop the volatile keys from a top-level context object.
pub fn strip_volatile(context: &Value) -> Value {
    match context {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// SHA-256 hex of the canonical JSON text.
pub fn fingerprint(value: &Value) -> String {
    let canonical = canonicalize(value);
    let text = serde_json::to_string(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Fingerprints from a strategy id/params pair and the runtime context
/// (risk, trailing, venue, symbol, timeframes).
pub fn compute_fingerprints(
    strategy_id: &str,
    strategy_params: &Value,
    runtime_context: &Value,
) -> StrategyRuntimeFingerprints {
    let strategy_config_fingerprint = fingerprint(&serde_json::json!({
        "id": strategy_id,
        "params": strategy_params,
    }));
    let runtime_context_fingerprint = fingerprint(&serde_json::json!({
        "strategy": strategy_config_fingerprint,
        "context": strip_volatile(runtime_context),
    }));

    StrategyRuntimeFingerprints {
        strategy_config_fingerprint,
        runtime_context_fingerprint,
    }
}

/// Decision-relevant subset of the configuration.
fn runtime_context(config: &AppConfig) -> Value {
    serde_json::json!({
        "venue": config.bot.venue,
        "symbol": config.bot.symbol.to_uppercase(),
        "timeframes": config.bot.timeframes,
        "execution_timeframe": config.bot.execution_timeframe,
        "risk": config.risk,
        "trailing": config.trailing,
    })
}

pub fn create_runtime_snapshot(config: &AppConfig, strategy: &dyn TraderStrategy) -> RuntimeSnapshot {
    let fingerprints = compute_fingerprints(strategy.id(), &strategy.params(), &runtime_context(config));

    let mut timeframes = config.bot.timeframes.clone();
    timeframes.sort();
    timeframes.dedup();

    RuntimeSnapshot {
        mode: config.bot.mode,
        venue: config.bot.venue.clone(),
        symbol: config.bot.symbol.to_uppercase(),
        timeframes,
        execution_timeframe: config.bot.execution_timeframe,
        strategy_id: strategy.id().to_string(),
        fingerprints,
    }
}
