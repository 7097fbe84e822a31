//! Base candle sources (WebSocket push, REST polling, backtest replay)
//!
//! A source emits closed candles of the single timeframe it was started with.
//! It does no aggregation and no gap detection; the plant owns both.

mod poll;
mod replay;
mod ws;

pub use poll::{PollingBaseCandleSource, PollingConfig};
pub use replay::BacktestBaseCandleSource;
pub use ws::{
    parse_kline_message, WsBaseCandleSource, WsConfig, WsFallbackConfig, BINANCE_FUTURES_WS_URL,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::types::{Candle, CandleMeta, Timeframe};

/// What a source should stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
}

/// Trait for base candle sources
#[async_trait]
pub trait BaseCandleSource: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Begin streaming into `sink`. Push/poll sources spawn their own task and
    /// return; the replay source emits every candle before returning.
    async fn start(&self, request: SourceRequest, sink: CandleSink) -> Result<()>;

    /// Stop streaming. Idempotent.
    async fn stop(&self);
}

/// A candle handed from a source to its consumer.
#[derive(Debug)]
pub struct SourcedCandle {
    pub candle: Candle,
    pub meta: CandleMeta,
    ack: Option<oneshot::Sender<()>>,
}

impl SourcedCandle {
    pub fn new(candle: Candle, meta: CandleMeta) -> Self {
        Self {
            candle,
            meta,
            ack: None,
        }
    }

    /// Release the source waiting on this candle.
    pub fn ack(&mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

impl Drop for SourcedCandle {
    fn drop(&mut self) {
        self.ack();
    }
}

/// Returned when the consuming side of a sink is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("candle consumer closed")]
pub struct SinkClosed;

/// Sending half of the single-consumer candle queue.
///
/// `emit` resolves once the consumer has finished with the candle, so a
/// source never runs ahead of downstream processing.
#[derive(Debug, Clone)]
pub struct CandleSink {
    tx: mpsc::Sender<SourcedCandle>,
}

impl CandleSink {
    pub fn channel(capacity: usize) -> (CandleSink, mpsc::Receiver<SourcedCandle>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (CandleSink { tx }, rx)
    }

    pub async fn emit(&self, candle: Candle, meta: CandleMeta) -> Result<(), SinkClosed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let item = SourcedCandle {
            candle,
            meta,
            ack: Some(ack_tx),
        };
        self.tx.send(item).await.map_err(|_| SinkClosed)?;
        // The consumer acks (or drops the item) once processing is done.
        let _ = ack_rx.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
