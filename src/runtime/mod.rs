//! Trader runtime - drives the tick loop from closed candle events
//!
//! [`TraderRuntime`] subscribes to the plant bus and reacts only to the
//! execution timeframe. Ticks run inline in the handler under a single async
//! lock, so they never overlap and see candles in emission order.

pub mod fingerprint;
pub mod snapshot;
pub mod tick;

pub use fingerprint::{
    canonicalize, compute_fingerprints, create_runtime_snapshot, RuntimeSnapshot,
    StrategyRuntimeFingerprints,
};
pub use snapshot::{build_tick_snapshot, ArrivalInfo, TickMeta, TickSnapshot};
pub use tick::{ExitKind, TickEngine, TickOutcome, TickPath, TrailingConfig};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::execution::PaperAccountSnapshot;
use crate::market_data::{CandleEventHandler, CandleHistoryView};
use crate::types::{Candle, ClosedCandleEvent, Timeframe};

/// Which events the runtime trades on and how much history it hands out.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub venue: String,
    pub symbol: String,
    pub timeframes: Vec<Timeframe>,
    pub execution_timeframe: Timeframe,
    /// Candles per timeframe in each snapshot
    pub series_limit: usize,
}

struct RuntimeState {
    equity: f64,
    ticks: Vec<TickOutcome>,
}

pub struct TraderRuntime {
    config: RuntimeConfig,
    history: CandleHistoryView,
    engine: TickEngine,
    state: Mutex<RuntimeState>,
}

impl TraderRuntime {
    pub fn new(config: RuntimeConfig, history: CandleHistoryView, engine: TickEngine, initial_equity: f64) -> Self {
        Self {
            config,
            history,
            engine,
            state: Mutex::new(RuntimeState {
                equity: initial_equity,
                ticks: Vec::new(),
            }),
        }
    }

    pub fn fingerprints(&self) -> &StrategyRuntimeFingerprints {
        self.engine.fingerprints()
    }

    /// Every tick outcome so far, oldest first.
    pub async fn ticks(&self) -> Vec<TickOutcome> {
        self.state.lock().await.ticks.clone()
    }

    pub async fn equity(&self) -> f64 {
        self.state.lock().await.equity
    }

    /// Account state after the most recent tick.
    pub async fn last_account(&self) -> Option<PaperAccountSnapshot> {
        self.state
            .lock()
            .await
            .ticks
            .last()
            .and_then(|t| t.account.clone())
    }

    fn is_tradable(&self, event: &ClosedCandleEvent) -> bool {
        event.timeframe == self.config.execution_timeframe
            && event.symbol.eq_ignore_ascii_case(&self.config.symbol)
    }

    /// Closed candles of every configured timeframe as of the execution
    /// candle's close.
    fn collect_series(&self, event: &ClosedCandleEvent) -> BTreeMap<Timeframe, Vec<Candle>> {
        let close_time = event.candle.close_time();
        self.config
            .timeframes
            .iter()
            .map(|tf| {
                let as_of = close_time - tf.duration_ms();
                (*tf, self.history.history_until(*tf, as_of, self.config.series_limit))
            })
            .collect()
    }
}

#[async_trait]
impl CandleEventHandler for TraderRuntime {
    async fn on_candle(&self, event: &ClosedCandleEvent) -> Result<()> {
        if !self.is_tradable(event) {
            return Ok(());
        }

        let mut state = self.state.lock().await;

        let series = self.collect_series(event);
        let snapshot = build_tick_snapshot(
            &self.config.symbol,
            &self.config.venue,
            self.config.execution_timeframe,
            event.candle.clone(),
            series,
            ArrivalInfo {
                arrival_delay_ms: event.arrival_delay_ms,
                source: Some(event.source),
                gap_filled: event.gap_filled,
            },
        )
        .with_context(|| format!("Snapshot for {} {} failed", event.symbol, event.timeframe))?;

        let outcome = self.engine.run_tick(&snapshot, state.equity).await;
        if outcome.execution.as_ref().is_some_and(|e| e.is_filled()) {
            info!(
                symbol = %self.config.symbol,
                ts = outcome.timestamp,
                side = %outcome.position.side,
                equity = outcome.equity,
                "💼 Position changed"
            );
        }
        state.equity = outcome.equity;
        state.ticks.push(outcome);
        Ok(())
    }
}
