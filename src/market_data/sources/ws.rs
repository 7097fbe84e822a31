//! Binance futures kline WebSocket source
//!
//! Subscribes to one `<symbol>@kline_<interval>` combined stream and emits
//! only closed klines (`k.x == true`). Disconnects reconnect after a fixed
//! delay. An optional REST fallback fills in closed candles while the socket
//! is unhealthy.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::poll::{poll_once, stop_previous};
use super::{BaseCandleSource, CandleSink, SourceRequest};
use crate::market_data::client::{json_f64, MarketDataClient};
use crate::types::{Candle, CandleMeta, CandleSource, Timeframe};

pub const BINANCE_FUTURES_WS_URL: &str = "wss://fstream.binance.com/stream";

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Combined stream endpoint, without the `?streams=` query
    pub url: String,
    pub reconnect_delay: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: BINANCE_FUTURES_WS_URL.to_string(),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// REST fallback used while the socket looks unhealthy.
#[derive(Debug, Clone)]
pub struct WsFallbackConfig {
    pub check_interval: Duration,
    pub limit: usize,
    /// Socket is healthy if a kline arrived within
    /// `max(health_factor * tf, health_floor_ms)`.
    pub health_factor: f64,
    pub health_floor_ms: i64,
    /// Fallback waits `grace_factor * tf + grace_floor_ms` past the expected
    /// close of the next candle before fetching.
    pub grace_factor: f64,
    pub grace_floor_ms: i64,
}

impl Default for WsFallbackConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            limit: 10,
            health_factor: 2.0,
            health_floor_ms: 30_000,
            grace_factor: 0.2,
            grace_floor_ms: 5_000,
        }
    }
}

impl WsFallbackConfig {
    pub fn health_window_ms(&self, timeframe: Timeframe) -> i64 {
        ((self.health_factor * timeframe.duration_ms() as f64) as i64).max(self.health_floor_ms)
    }

    pub fn grace_ms(&self, timeframe: Timeframe) -> i64 {
        (self.grace_factor * timeframe.duration_ms() as f64) as i64 + self.grace_floor_ms
    }

    /// Whether the socket delivered anything recently enough.
    pub fn is_healthy(&self, last_arrival: i64, now: i64, timeframe: Timeframe) -> bool {
        last_arrival != i64::MIN && now - last_arrival <= self.health_window_ms(timeframe)
    }

    /// Whether the candle after `last_emitted` is overdue by more than the grace period.
    pub fn is_due(&self, last_emitted: i64, now: i64, timeframe: Timeframe) -> bool {
        if last_emitted == i64::MIN {
            return true;
        }
        let expected_close = last_emitted + 2 * timeframe.duration_ms();
        now >= expected_close + self.grace_ms(timeframe)
    }
}

/// WebSocket kline source with optional REST fallback.
pub struct WsBaseCandleSource {
    config: WsConfig,
    fallback: Option<(Arc<dyn MarketDataClient>, WsFallbackConfig)>,
    last_emitted: Arc<AtomicI64>,
    last_arrival: Arc<AtomicI64>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsBaseCandleSource {
    pub fn new(config: WsConfig) -> Self {
        Self {
            config,
            fallback: None,
            last_emitted: Arc::new(AtomicI64::new(i64::MIN)),
            last_arrival: Arc::new(AtomicI64::new(i64::MIN)),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_rest_fallback(
        mut self,
        client: Arc<dyn MarketDataClient>,
        fallback: WsFallbackConfig,
    ) -> Self {
        self.fallback = Some((client, fallback));
        self
    }

    fn build_stream_url(base: &str, request: &SourceRequest) -> String {
        format!(
            "{}?streams={}@kline_{}",
            base.trim_end_matches('/'),
            request.symbol.to_lowercase(),
            request.timeframe
        )
    }
}

/// Parse a kline message (combined-stream or raw) into a closed candle.
///
/// Returns `Ok(None)` for klines that are still open and for non-kline
/// messages such as subscription acks.
pub fn parse_kline_message(
    text: &str,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<Option<Candle>> {
    let wrapper: serde_json::Value = serde_json::from_str(text)?;
    let data = wrapper.get("data").unwrap_or(&wrapper);

    let Some(k) = data.get("k") else {
        return Ok(None);
    };
    if !k["x"].as_bool().unwrap_or(false) {
        return Ok(None);
    }

    let timestamp = k["t"].as_i64().context("Missing kline open time")?;
    let symbol = k["s"]
        .as_str()
        .or_else(|| data["s"].as_str())
        .unwrap_or(symbol)
        .to_uppercase();

    Ok(Some(Candle {
        symbol,
        timeframe,
        timestamp,
        open: json_f64(&k["o"]).context("Missing open")?,
        high: json_f64(&k["h"]).context("Missing high")?,
        low: json_f64(&k["l"]).context("Missing low")?,
        close: json_f64(&k["c"]).context("Missing close")?,
        volume: json_f64(&k["v"]).context("Missing volume")?,
    }))
}

struct StreamState {
    request: SourceRequest,
    sink: CandleSink,
    last_emitted: Arc<AtomicI64>,
    last_arrival: Arc<AtomicI64>,
}

impl StreamState {
    async fn handle_text(&self, text: &str) {
        let now = Utc::now().timestamp_millis();
        self.last_arrival.store(now, Ordering::SeqCst);

        let candle = match parse_kline_message(text, &self.request.symbol, self.request.timeframe) {
            Ok(Some(candle)) => candle,
            Ok(None) => return,
            Err(e) => {
                warn!(source = "binance-ws", error = %e, "Failed to parse kline message");
                return;
            }
        };

        if candle.timestamp <= self.last_emitted.load(Ordering::SeqCst) {
            return;
        }
        let ts = candle.timestamp;
        let meta = CandleMeta {
            received_at: now,
            source: CandleSource::Ws,
        };
        if self.sink.emit(candle, meta).await.is_ok() {
            self.last_emitted.fetch_max(ts, Ordering::SeqCst);
        }
    }
}

async fn run_stream(
    url: String,
    reconnect_delay: Duration,
    state: StreamState,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;

    'reconnect: loop {
        info!(
            source = "binance-ws",
            url = %url.split('?').next().unwrap_or(url.as_str()),
            attempt,
            "Connecting to Binance WebSocket..."
        );

        let connected = tokio::select! {
            _ = shutdown.changed() => break 'reconnect,
            res = connect_async(&url) => res,
        };

        match connected {
            Ok((ws_stream, _)) => {
                attempt = 0;
                info!(source = "binance-ws", "✅ Connected to Binance WebSocket");
                let (mut write, mut read) = ws_stream.split();

                loop {
                    let msg = tokio::select! {
                        _ = shutdown.changed() => {
                            let _ = write.send(Message::Close(None)).await;
                            break 'reconnect;
                        }
                        msg = read.next() => msg,
                    };

                    match msg {
                        Some(Ok(Message::Text(text))) => state.handle_text(&text).await,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!(source = "binance-ws", "Connection closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(source = "binance-ws", error = %e, "WebSocket error");
                            break;
                        }
                        None => {
                            warn!(source = "binance-ws", "Stream ended");
                            break;
                        }
                        _ => {}
                    }

                    if state.sink.is_closed() {
                        break 'reconnect;
                    }
                }
            }
            Err(e) => {
                error!(source = "binance-ws", error = %e, "Connection failed");
            }
        }

        attempt = attempt.saturating_add(1);
        info!(
            source = "binance-ws",
            delay_ms = reconnect_delay.as_millis() as u64,
            attempt,
            "🔄 Reconnecting"
        );
        tokio::select! {
            _ = shutdown.changed() => break 'reconnect,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    debug!(source = "binance-ws", "Stream task exited");
}

async fn run_fallback(
    client: Arc<dyn MarketDataClient>,
    config: WsFallbackConfig,
    request: SourceRequest,
    sink: CandleSink,
    last_emitted: Arc<AtomicI64>,
    last_arrival: Arc<AtomicI64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let now = Utc::now().timestamp_millis();
        if config.is_healthy(last_arrival.load(Ordering::SeqCst), now, request.timeframe) {
            continue;
        }
        if !config.is_due(last_emitted.load(Ordering::SeqCst), now, request.timeframe) {
            continue;
        }

        match poll_once(
            client.as_ref(),
            &request,
            config.limit,
            &last_emitted,
            &sink,
            CandleSource::Rest,
        )
        .await
        {
            Ok(0) => {}
            Ok(n) => info!(
                source = "binance-ws",
                emitted = n,
                "REST fallback emitted candles while socket unhealthy"
            ),
            Err(e) => warn!(source = "binance-ws", error = %e, "REST fallback poll failed"),
        }

        if sink.is_closed() {
            break;
        }
    }
}

#[async_trait]
impl BaseCandleSource for WsBaseCandleSource {
    fn name(&self) -> &'static str {
        "binance-ws"
    }

    async fn start(&self, request: SourceRequest, sink: CandleSink) -> Result<()> {
        let url = Self::build_stream_url(&self.config.url, &request);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Some((client, fallback)) = &self.fallback {
            tokio::spawn(run_fallback(
                client.clone(),
                fallback.clone(),
                request.clone(),
                sink.clone(),
                self.last_emitted.clone(),
                self.last_arrival.clone(),
                shutdown_rx.clone(),
            ));
        }

        let state = StreamState {
            request,
            sink,
            last_emitted: self.last_emitted.clone(),
            last_arrival: self.last_arrival.clone(),
        };
        let handle = tokio::spawn(run_stream(
            url,
            self.config.reconnect_delay,
            state,
            shutdown_rx,
        ));

        stop_previous(&self.shutdown, &self.task, shutdown_tx, handle);
        Ok(())
    }

    async fn stop(&self) {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
            info!(source = self.name(), "WebSocket source stopped");
        }
        self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}
