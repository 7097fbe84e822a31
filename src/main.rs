//! PerpBot - closed-candle futures trading runtime
//!
//! `backtest` replays exchange history through the same plant and tick loop
//! that `paper` runs against the live stream.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use perpbot::config::AppConfig;
use perpbot::error::ConfigError;
use perpbot::execution::{ExecutionProvider, PaperExecutionEngine};
use perpbot::market_data::sources::{
    BacktestBaseCandleSource, BaseCandleSource, PollingBaseCandleSource, WsBaseCandleSource,
};
use perpbot::market_data::{
    BinanceRestClient, HistoricalCandleClient, MarketDataClient, MarketDataPlant,
};
use perpbot::risk::PercentRiskManager;
use perpbot::runtime::{create_runtime_snapshot, TickEngine, TraderRuntime};
use perpbot::strategy::StrategyRegistry;
use perpbot::types::{Candle, ExecutionMode, Timeframe};

/// Rows per kline request while downloading backtest history
const FETCH_PAGE: usize = 1500;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load()?;
    config.validate().context("Invalid configuration")?;
    info!("🚀 Starting PerpBot {}", config);

    let registry = StrategyRegistry::default();
    let strategy = registry
        .build(&config.strategy.id, &config.strategy.params)
        .with_context(|| format!("Available strategies: {:?}", registry.ids()))?;

    let snapshot = create_runtime_snapshot(&config, strategy.as_ref());
    info!(
        event = "runtime_snapshot",
        mode = %snapshot.mode,
        venue = %snapshot.venue,
        symbol = %snapshot.symbol,
        execution_timeframe = %snapshot.execution_timeframe,
        strategy = %snapshot.strategy_id,
        strategy_config_fingerprint = %snapshot.fingerprints.strategy_config_fingerprint,
        runtime_context_fingerprint = %snapshot.fingerprints.runtime_context_fingerprint,
        "🧬 Runtime snapshot"
    );

    let rest: Arc<dyn MarketDataClient> = Arc::new(BinanceRestClient::new(&config.market_data.rest_url)?);
    let (client, source) = match config.bot.mode {
        ExecutionMode::Backtest => backtest_inputs(&config, rest.as_ref()).await?,
        ExecutionMode::Paper => (rest.clone(), streaming_source(&config, rest)),
        ExecutionMode::Live => return Err(ConfigError::MissingOrderClient.into()),
    };

    let plant = MarketDataPlant::new(config.plant_config(), client, source)?;
    let execution = Arc::new(PaperExecutionEngine::new(config.bot.mode, config.paper.clone()));
    let engine = TickEngine::new(
        &snapshot.symbol,
        strategy,
        Arc::new(PercentRiskManager::new(config.risk.clone())),
        execution.clone(),
        config.trailing.clone(),
        snapshot.fingerprints.clone(),
    );
    let runtime = Arc::new(TraderRuntime::new(
        config.runtime_config(),
        plant.history_view(),
        engine,
        config.paper.initial_balance,
    ));
    let subscription = plant.on_candle(runtime.clone());

    plant.start().await?;

    if config.bot.mode == ExecutionMode::Paper {
        info!("📡 Streaming, press Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C, stopping");
        }
        info!("🛑 Shutdown signal received");
    }

    plant.stop().await;
    subscription.unsubscribe();

    let ticks = runtime.ticks().await.len();
    let account = match runtime.last_account().await {
        Some(account) => Some(account),
        None => execution.snapshot_account(0.0),
    };
    info!(ticks, equity = runtime.equity().await, "🏁 Run finished");
    println!("{}", serde_json::to_string_pretty(&account)?);

    Ok(())
}

/// `RUST_LOG` filter (default `info`); JSON lines when `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn streaming_source(config: &AppConfig, rest: Arc<dyn MarketDataClient>) -> Arc<dyn BaseCandleSource> {
    if config.market_data.source == "poll" {
        return Arc::new(PollingBaseCandleSource::new(rest, config.polling_config()));
    }
    let mut ws = WsBaseCandleSource::new(config.ws_config());
    if config.market_data.ws_fallback_enabled {
        ws = ws.with_rest_fallback(rest, config.ws_fallback_config());
    }
    Arc::new(ws)
}

/// Download history once and split it into the bootstrap window (served
/// to the plant as REST history) and the replayed remainder.
async fn backtest_inputs(
    config: &AppConfig,
    rest: &dyn MarketDataClient,
) -> Result<(Arc<dyn MarketDataClient>, Arc<dyn BaseCandleSource>)> {
    let Some(base) = config.bot.timeframes.iter().min().copied() else {
        return Err(ConfigError::NoTimeframes.into());
    };
    let total = config.market_data.history_limit + config.backtest.candles;
    let mut candles = fetch_history(rest, &config.bot.symbol, base, total).await?;
    if candles.is_empty() {
        bail!("No {} history returned for {}", base, config.bot.symbol);
    }

    let split = config.market_data.history_limit.min(candles.len());
    let replay = candles.split_off(split);
    info!(
        symbol = %config.bot.symbol,
        timeframe = %base,
        bootstrap = candles.len(),
        replay = replay.len(),
        "📚 Backtest history loaded"
    );

    Ok((
        Arc::new(HistoricalCandleClient::new(candles)),
        Arc::new(BacktestBaseCandleSource::new(replay)),
    ))
}

/// The latest `total` closed candles, paging forward from the window start.
async fn fetch_history(
    client: &dyn MarketDataClient,
    symbol: &str,
    timeframe: Timeframe,
    total: usize,
) -> Result<Vec<Candle>> {
    let tf_ms = timeframe.duration_ms();
    let now = Utc::now().timestamp_millis();
    let mut cursor = timeframe.bucket_start(now) - total as i64 * tf_ms;
    let mut out: Vec<Candle> = Vec::with_capacity(total);

    while out.len() < total {
        let page = client
            .fetch_ohlcv(symbol, timeframe, (total - out.len()).min(FETCH_PAGE), Some(cursor))
            .await
            .with_context(|| format!("Failed to fetch {} history from {}", timeframe, cursor))?;
        let Some(last) = page.last() else { break };
        cursor = last.timestamp + tf_ms;
        out.extend(page);
    }

    out.retain(|c| c.close_time() <= now);
    out.dedup_by_key(|c| c.timestamp);
    Ok(out)
}
