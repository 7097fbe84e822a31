//! REST polling candle source

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BaseCandleSource, CandleSink, SourceRequest};
use crate::market_data::client::MarketDataClient;
use crate::types::{Candle, CandleMeta, CandleSource};

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
    /// Candles requested per poll; everything newer than the last emitted
    /// candle in this window is emitted.
    pub limit: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            limit: 5,
        }
    }
}

/// Polls the REST client on a fixed interval and emits newly closed candles.
pub struct PollingBaseCandleSource {
    client: Arc<dyn MarketDataClient>,
    config: PollingConfig,
    last_emitted: Arc<AtomicI64>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingBaseCandleSource {
    pub fn new(client: Arc<dyn MarketDataClient>, config: PollingConfig) -> Self {
        Self {
            client,
            config,
            last_emitted: Arc::new(AtomicI64::new(i64::MIN)),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

/// Closed candles newer than `last_emitted`, ascending.
pub(crate) fn select_new_closed(mut fetched: Vec<Candle>, last_emitted: i64, now: i64) -> Vec<Candle> {
    fetched.sort_by_key(|c| c.timestamp);
    fetched.dedup_by_key(|c| c.timestamp);
    fetched
        .into_iter()
        .filter(|c| c.timestamp > last_emitted && c.close_time() <= now)
        .collect()
}

/// Fetch the recent window and emit anything not yet emitted. Returns the
/// number of candles emitted.
pub(crate) async fn poll_once(
    client: &dyn MarketDataClient,
    request: &SourceRequest,
    limit: usize,
    last_emitted: &AtomicI64,
    sink: &CandleSink,
    source: CandleSource,
) -> Result<usize> {
    let fetched = client
        .fetch_ohlcv(&request.symbol, request.timeframe, limit, None)
        .await?;
    let now = Utc::now().timestamp_millis();

    let mut emitted = 0;
    for candle in select_new_closed(fetched, last_emitted.load(Ordering::SeqCst), now) {
        // Re-check: a concurrent emitter sharing this marker may have moved it.
        if candle.timestamp <= last_emitted.load(Ordering::SeqCst) {
            continue;
        }
        let ts = candle.timestamp;
        let meta = CandleMeta {
            received_at: Utc::now().timestamp_millis(),
            source,
        };
        if sink.emit(candle, meta).await.is_err() {
            break;
        }
        last_emitted.fetch_max(ts, Ordering::SeqCst);
        emitted += 1;
    }
    Ok(emitted)
}

#[async_trait]
impl BaseCandleSource for PollingBaseCandleSource {
    fn name(&self) -> &'static str {
        "rest-poll"
    }

    async fn start(&self, request: SourceRequest, sink: CandleSink) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();
        let config = self.config.clone();
        let last_emitted = self.last_emitted.clone();
        let name = self.name();

        info!(
            source = name,
            symbol = %request.symbol,
            timeframe = %request.timeframe,
            interval_ms = config.interval.as_millis() as u64,
            "Starting REST polling"
        );

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {}
                }
                match poll_once(
                    client.as_ref(),
                    &request,
                    config.limit,
                    &last_emitted,
                    &sink,
                    CandleSource::Poll,
                )
                .await
                {
                    Ok(0) => {}
                    Ok(n) => debug!(source = name, emitted = n, "Poll emitted candles"),
                    Err(e) => warn!(source = name, error = %e, "Poll failed"),
                }
                if sink.is_closed() {
                    break;
                }
            }
            debug!(source = name, "Polling loop exited");
        });

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
            info!(source = self.name(), "Polling stopped");
        }
        // Let the loop finish the poll in flight; just forget the handle.
        self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

/// Install the new task's handles, signalling any previous task to exit.
pub(crate) fn stop_previous(
    shutdown: &Mutex<Option<watch::Sender<bool>>>,
    task: &Mutex<Option<JoinHandle<()>>>,
    new_shutdown: watch::Sender<bool>,
    new_task: JoinHandle<()>,
) {
    if let Some(old) = shutdown
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .replace(new_shutdown)
    {
        let _ = old.send(true);
    }
    task.lock().unwrap_or_else(|p| p.into_inner()).replace(new_task);
}
