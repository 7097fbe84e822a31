//! Backtest and paper runs over the same candles must decide identically

#[cfg(test)]
mod tests {
    use perpbot::config::AppConfig;
    use perpbot::execution::PaperExecutionEngine;
    use perpbot::market_data::sources::BacktestBaseCandleSource;
    use perpbot::market_data::{HistoricalCandleClient, MarketDataPlant};
    use perpbot::risk::PercentRiskManager;
    use perpbot::runtime::{
        create_runtime_snapshot, RuntimeSnapshot, TickEngine, TickOutcome, TraderRuntime,
    };
    use perpbot::strategy::StrategyRegistry;
    use perpbot::types::{Candle, ExecutionMode, Timeframe};
    use std::sync::Arc;

    const MINUTE: i64 = 60_000;
    const BOOTSTRAP: usize = 50;

    fn config(mode: &str) -> AppConfig {
        AppConfig::defaults()
            .unwrap()
            .set_override("bot.mode", mode)
            .unwrap()
            .set_override("bot.timeframes", vec!["1m", "5m"])
            .unwrap()
            .set_override("bot.execution_timeframe", "5m")
            .unwrap()
            .set_override("market_data.history_limit", BOOTSTRAP as i64)
            .unwrap()
            .set_override("strategy.params.fast", 3)
            .unwrap()
            .set_override("strategy.params.slow", 8)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    /// Two and a half slow waves plus a drift, so the averages cross often.
    fn candles() -> Vec<Candle> {
        (0..300)
            .map(|i| {
                let t = i as f64;
                let close = 100.0 + 10.0 * (t / 15.0).sin() + 0.01 * t;
                let open = 100.0 + 10.0 * ((t - 1.0) / 15.0).sin() + 0.01 * (t - 1.0);
                Candle {
                    symbol: "BTCUSDT".to_string(),
                    timeframe: Timeframe::M1,
                    timestamp: i * MINUTE,
                    open,
                    high: open.max(close) + 0.2,
                    low: open.min(close) - 0.2,
                    close,
                    volume: 1.0,
                }
            })
            .collect()
    }

    async fn run(config: &AppConfig) -> (RuntimeSnapshot, Vec<TickOutcome>) {
        let strategy = StrategyRegistry::default()
            .build(&config.strategy.id, &config.strategy.params)
            .unwrap();
        let snapshot = create_runtime_snapshot(config, strategy.as_ref());

        let mut bootstrap = candles();
        let replay = bootstrap.split_off(BOOTSTRAP);
        let plant = MarketDataPlant::new(
            config.plant_config(),
            Arc::new(HistoricalCandleClient::new(bootstrap)),
            Arc::new(BacktestBaseCandleSource::new(replay)),
        )
        .unwrap();

        let engine = TickEngine::new(
            &snapshot.symbol,
            strategy,
            Arc::new(PercentRiskManager::new(config.risk.clone())),
            Arc::new(PaperExecutionEngine::new(config.bot.mode, config.paper.clone())),
            config.trailing.clone(),
            snapshot.fingerprints.clone(),
        );
        let runtime = Arc::new(TraderRuntime::new(
            config.runtime_config(),
            plant.history_view(),
            engine,
            config.paper.initial_balance,
        ));
        let _sub = plant.on_candle(runtime.clone());

        plant.start().await.unwrap();
        plant.stop().await;

        (snapshot, runtime.ticks().await)
    }

    // ============================================================================
    // Parity
    // ============================================================================

    #[tokio::test]
    async fn backtest_and_paper_produce_identical_ticks() {
        let backtest = config("backtest");
        let paper = config("paper");
        assert_eq!(backtest.bot.mode, ExecutionMode::Backtest);

        let (bt_snapshot, bt_ticks) = run(&backtest).await;
        let (paper_snapshot, paper_ticks) = run(&paper).await;

        assert_eq!(bt_snapshot.fingerprints, paper_snapshot.fingerprints);
        // 250 replayed minutes close 50 five-minute candles
        assert_eq!(bt_ticks.len(), 50);
        assert_eq!(bt_ticks, paper_ticks);

        let fills = bt_ticks
            .iter()
            .filter(|t| t.execution.as_ref().is_some_and(|e| e.is_filled()))
            .count();
        assert!(fills > 0, "strategy never traded");

        // Every intent carries the run's fingerprints
        for tick in bt_ticks.iter().filter_map(|t| t.intent.as_ref()) {
            assert_eq!(
                tick.runtime_context_fingerprint.as_deref(),
                Some(bt_snapshot.fingerprints.runtime_context_fingerprint.as_str())
            );
        }

        // Ticks follow candle order
        assert!(bt_ticks.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    // ============================================================================
    // Fingerprints
    // ============================================================================

    #[test]
    fn mode_does_not_change_fingerprints() {
        let registry = StrategyRegistry::default();
        let paper = config("paper");
        let live = config("live");
        let strategy = registry.build(&paper.strategy.id, &paper.strategy.params).unwrap();

        let a = create_runtime_snapshot(&paper, strategy.as_ref());
        let b = create_runtime_snapshot(&live, strategy.as_ref());
        assert_eq!(a.fingerprints, b.fingerprints);
        assert_ne!(a.mode, b.mode);
    }

    #[test]
    fn risk_change_moves_runtime_fingerprint_only() {
        let registry = StrategyRegistry::default();
        let base = config("paper");
        let mut riskier = base.clone();
        riskier.risk.risk_per_trade_percent = 2.0;
        let strategy = registry.build(&base.strategy.id, &base.strategy.params).unwrap();

        let a = create_runtime_snapshot(&base, strategy.as_ref());
        let b = create_runtime_snapshot(&riskier, strategy.as_ref());
        assert_eq!(
            a.fingerprints.strategy_config_fingerprint,
            b.fingerprints.strategy_config_fingerprint
        );
        assert_ne!(
            a.fingerprints.runtime_context_fingerprint,
            b.fingerprints.runtime_context_fingerprint
        );
    }

    #[test]
    fn strategy_params_move_both_fingerprints() {
        let registry = StrategyRegistry::default();
        let config = config("paper");
        let fast = registry
            .build("sma_cross", &serde_json::json!({"fast": 3, "slow": 8}))
            .unwrap();
        let slow = registry
            .build("sma_cross", &serde_json::json!({"fast": 4, "slow": 8}))
            .unwrap();

        let a = create_runtime_snapshot(&config, fast.as_ref());
        let b = create_runtime_snapshot(&config, slow.as_ref());
        assert_ne!(
            a.fingerprints.strategy_config_fingerprint,
            b.fingerprints.strategy_config_fingerprint
        );
        assert_ne!(
            a.fingerprints.runtime_context_fingerprint,
            b.fingerprints.runtime_context_fingerprint
        );
    }
}
