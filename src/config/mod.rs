//! Configuration management for PerpBot
//!
//! Built-in defaults, then `config/default.*` and `config/local.*`, then
//! `PERPBOT__SECTION__KEY` environment variables (after loading `.env`).

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;
use crate::execution::PaperConfig;
use crate::market_data::plant::PlantConfig;
use crate::market_data::sources::{PollingConfig, WsConfig, WsFallbackConfig};
use crate::risk::RiskSettings;
use crate::runtime::{RuntimeConfig, TrailingConfig};
use crate::types::{ExecutionMode, Timeframe};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub market_data: MarketDataConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskSettings,
    pub trailing: TrailingConfig,
    pub paper: PaperConfig,
    pub backtest: BacktestConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Version tag for logging
    pub tag: String,
    /// Signal venue name
    pub venue: String,
    /// Futures symbol (BTCUSDT)
    pub symbol: String,
    /// Requested timeframes; the smallest is streamed, the rest aggregated
    pub timeframes: Vec<Timeframe>,
    /// Timeframe whose closes drive the tick loop
    pub execution_timeframe: Timeframe,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    /// "ws" or "poll"
    pub source: String,
    pub rest_url: String,
    pub ws_url: String,
    /// Base candles fetched at bootstrap
    pub history_limit: usize,
    pub gap_repair_enabled: bool,
    /// Max candles per gap repair request
    pub gap_fetch_limit: usize,
    pub poll_interval_ms: u64,
    pub poll_limit: usize,
    pub ws_reconnect_delay_ms: u64,
    /// Poll REST while the socket is silent
    pub ws_fallback_enabled: bool,
    pub ws_health_factor: f64,
    pub ws_health_floor_ms: i64,
    pub fallback_grace_factor: f64,
    pub fallback_grace_floor_ms: i64,
    pub fallback_check_interval_ms: u64,
    pub fallback_limit: usize,
    /// Candles per timeframe handed to the strategy
    pub series_limit: usize,
    /// Candles kept per timeframe
    pub buffer_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Registry id
    pub id: String,
    /// Strategy-specific parameters
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacktestConfig {
    /// Base candles replayed after the bootstrap window
    pub candles: usize,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PERPBOT__*)
            .add_source(
                Environment::with_prefix("PERPBOT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bot.timeframes"),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Built-in defaults only, without files or environment.
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.venue", "binance")?
            .set_default("bot.symbol", "BTCUSDT")?
            .set_default("bot.timeframes", vec!["1m", "5m", "15m"])?
            .set_default("bot.execution_timeframe", "5m")?
            .set_default("bot.mode", "paper")?
            // Market data defaults
            .set_default("market_data.source", "ws")?
            .set_default("market_data.rest_url", crate::market_data::BINANCE_FUTURES_REST_URL)?
            .set_default("market_data.ws_url", crate::market_data::sources::BINANCE_FUTURES_WS_URL)?
            .set_default("market_data.history_limit", 500)?
            .set_default("market_data.gap_repair_enabled", true)?
            .set_default("market_data.gap_fetch_limit", 1000)?
            .set_default("market_data.poll_interval_ms", 5000)?
            .set_default("market_data.poll_limit", 10)?
            .set_default("market_data.ws_reconnect_delay_ms", 1000)?
            .set_default("market_data.ws_fallback_enabled", true)?
            .set_default("market_data.ws_health_factor", 2.0)?
            .set_default("market_data.ws_health_floor_ms", 30_000)?
            .set_default("market_data.fallback_grace_factor", 0.2)?
            .set_default("market_data.fallback_grace_floor_ms", 5000)?
            .set_default("market_data.fallback_check_interval_ms", 5000)?
            .set_default("market_data.fallback_limit", 10)?
            .set_default("market_data.series_limit", 200)?
            .set_default("market_data.buffer_capacity", 2000)?
            // Strategy defaults
            .set_default("strategy.id", "sma_cross")?
            // Risk defaults
            .set_default("risk.risk_per_trade_percent", 1.0)?
            .set_default("risk.default_stop_loss_pct", 0.01)?
            .set_default("risk.take_profit_r_multiple", 2.0)?
            .set_default("risk.max_leverage", 3.0)?
            // Trailing defaults
            .set_default("trailing.enabled", true)?
            .set_default("trailing.activation_pct", 0.01)?
            .set_default("trailing.trail_pct", 0.005)?
            // Paper defaults
            .set_default("paper.initial_balance", 10_000.0)?
            .set_default("paper.fee_bps", 0.0)?
            // Backtest defaults
            .set_default("backtest.candles", 1000)?;
        Ok(builder)
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bot = &self.bot;
        let md = &self.market_data;

        if bot.symbol.trim().is_empty() {
            return Err(invalid("bot.symbol", "must not be empty"));
        }
        let Some(base) = bot.timeframes.iter().min().copied() else {
            return Err(ConfigError::NoTimeframes);
        };
        if !bot.timeframes.contains(&bot.execution_timeframe) {
            return Err(ConfigError::ExecutionTimeframeNotRequested(bot.execution_timeframe));
        }
        if md.source != "ws" && md.source != "poll" {
            return Err(ConfigError::UnknownSource(md.source.clone()));
        }

        for (field, value) in [
            ("market_data.history_limit", md.history_limit),
            ("market_data.gap_fetch_limit", md.gap_fetch_limit),
            ("market_data.poll_limit", md.poll_limit),
            ("market_data.fallback_limit", md.fallback_limit),
            ("market_data.series_limit", md.series_limit),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }

        // A full bucket of the largest timeframe must fit in the base history
        if let Some(largest) = bot.timeframes.iter().max() {
            let ratio = (largest.duration_ms() / base.duration_ms()) as usize;
            if md.buffer_capacity < ratio.max(md.series_limit) {
                return Err(invalid(
                    "market_data.buffer_capacity",
                    format!("must be at least {}", ratio.max(md.series_limit)),
                ));
            }
        }

        if !(md.ws_health_factor > 0.0) || md.ws_health_floor_ms < 0 {
            return Err(invalid("market_data.ws_health_factor", "must be positive"));
        }
        if md.fallback_grace_factor < 0.0 || md.fallback_grace_floor_ms < 0 {
            return Err(invalid("market_data.fallback_grace_factor", "must not be negative"));
        }

        if !(self.risk.risk_per_trade_percent > 0.0) {
            return Err(invalid("risk.risk_per_trade_percent", "must be positive"));
        }
        if !(self.risk.default_stop_loss_pct > 0.0 && self.risk.default_stop_loss_pct < 1.0) {
            return Err(invalid("risk.default_stop_loss_pct", "must be in (0, 1)"));
        }
        if !(self.risk.max_leverage > 0.0) {
            return Err(invalid("risk.max_leverage", "must be positive"));
        }
        if self.trailing.enabled {
            if !(self.trailing.trail_pct > 0.0 && self.trailing.trail_pct < 1.0) {
                return Err(invalid("trailing.trail_pct", "must be in (0, 1)"));
            }
            if self.trailing.activation_pct < 0.0 {
                return Err(invalid("trailing.activation_pct", "must not be negative"));
            }
        }
        if !(self.paper.initial_balance > 0.0) {
            return Err(invalid("paper.initial_balance", "must be positive"));
        }
        if self.paper.fee_bps < 0.0 {
            return Err(invalid("paper.fee_bps", "must not be negative"));
        }

        // No exchange order client ships with the binary
        if bot.mode == ExecutionMode::Live {
            return Err(ConfigError::MissingOrderClient);
        }

        Ok(())
    }

    pub fn plant_config(&self) -> PlantConfig {
        PlantConfig {
            venue: self.bot.venue.clone(),
            symbol: self.bot.symbol.to_uppercase(),
            timeframes: self.bot.timeframes.clone(),
            history_limit: self.market_data.history_limit,
            gap_repair_enabled: self.market_data.gap_repair_enabled,
            gap_fetch_limit: self.market_data.gap_fetch_limit,
            buffer_capacity: self.market_data.buffer_capacity,
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            venue: self.bot.venue.clone(),
            symbol: self.bot.symbol.to_uppercase(),
            timeframes: self.bot.timeframes.clone(),
            execution_timeframe: self.bot.execution_timeframe,
            series_limit: self.market_data.series_limit,
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig {
            interval: Duration::from_millis(self.market_data.poll_interval_ms),
            limit: self.market_data.poll_limit,
        }
    }

    pub fn ws_config(&self) -> WsConfig {
        WsConfig {
            url: self.market_data.ws_url.clone(),
            reconnect_delay: Duration::from_millis(self.market_data.ws_reconnect_delay_ms),
        }
    }

    pub fn ws_fallback_config(&self) -> WsFallbackConfig {
        let md = &self.market_data;
        WsFallbackConfig {
            check_interval: Duration::from_millis(md.fallback_check_interval_ms),
            limit: md.fallback_limit,
            health_factor: md.ws_health_factor,
            health_floor_ms: md.ws_health_floor_ms,
            grace_factor: md.fallback_grace_factor,
            grace_floor_ms: md.fallback_grace_floor_ms,
        }
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} mode={} venue={} symbol={} timeframes={:?} exec_tf={} source={} strategy={}",
            self.bot.tag,
            self.bot.mode,
            self.bot.venue,
            self.bot.symbol,
            self.bot.timeframes.iter().map(|tf| tf.label()).collect::<Vec<_>>(),
            self.bot.execution_timeframe,
            self.market_data.source,
            self.strategy.id
        )
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> AppConfig {
        AppConfig::defaults()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = defaults();
        assert_eq!(config.bot.timeframes, vec![Timeframe::M1, Timeframe::M5, Timeframe::M15]);
        assert_eq!(config.bot.execution_timeframe, Timeframe::M5);
        assert_eq!(config.bot.mode, ExecutionMode::Paper);
        assert!(config.strategy.params.is_null());
        config.validate().unwrap();
    }

    #[test]
    fn overrides_parse_timeframes_and_mode() {
        let config: AppConfig = AppConfig::defaults()
            .unwrap()
            .set_override("bot.timeframes", vec!["1m", "1h"])
            .unwrap()
            .set_override("bot.execution_timeframe", "1h")
            .unwrap()
            .set_override("bot.mode", "backtest")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.bot.timeframes, vec![Timeframe::M1, Timeframe::H1]);
        assert_eq!(config.bot.mode, ExecutionMode::Backtest);
        config.validate().unwrap();
    }

    #[test]
    fn bad_timeframe_label_fails_to_load() {
        let result = AppConfig::defaults()
            .unwrap()
            .set_override("bot.execution_timeframe", "7x")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize::<AppConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn execution_timeframe_must_be_requested() {
        let mut config = defaults();
        config.bot.execution_timeframe = Timeframe::H1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ExecutionTimeframeNotRequested(tf)) if tf == Timeframe::H1
        ));

        config.bot.timeframes.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoTimeframes)));
    }

    #[test]
    fn rejects_unknown_source_and_live_mode() {
        let mut config = defaults();
        config.market_data.source = "fix".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownSource(_))));

        let mut config = defaults();
        config.bot.mode = ExecutionMode::Live;
        assert!(matches!(config.validate(), Err(ConfigError::MissingOrderClient)));
    }

    #[test]
    fn buffer_must_hold_a_full_higher_bucket() {
        let mut config = defaults();
        config.bot.timeframes = vec![Timeframe::M1, Timeframe::D1];
        config.bot.execution_timeframe = Timeframe::M1;
        config.market_data.buffer_capacity = 1000;
        match config.validate() {
            Err(ConfigError::InvalidValue { field, reason }) => {
                assert_eq!(field, "market_data.buffer_capacity");
                assert!(reason.contains("1440"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn digest_names_the_essentials() {
        let digest = defaults().to_string();
        assert!(digest.contains("symbol=BTCUSDT"));
        assert!(digest.contains("exec_tf=5m"));
        assert!(digest.contains("strategy=sma_cross"));
    }
}
