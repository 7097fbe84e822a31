//! Closed-candle event fan-out
//!
//! Subscribers register a handler and get back a [`Subscription`] that
//! removes it again. Handlers are awaited one after another in registration
//! order; a failing handler is logged and does not affect the others.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

use crate::types::ClosedCandleEvent;

/// Receives closed candle events from the plant.
#[async_trait]
pub trait CandleEventHandler: Send + Sync {
    async fn on_candle(&self, event: &ClosedCandleEvent) -> Result<()>;
}

type HandlerList = Mutex<Vec<(u64, Arc<dyn CandleEventHandler>)>>;

/// Publish/subscribe channel for [`ClosedCandleEvent`]s.
#[derive(Default)]
pub struct CandleEventBus {
    handlers: Arc<HandlerList>,
    next_id: AtomicU64,
}

impl CandleEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn CandleEventHandler>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).push((id, handler));
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Deliver `event` to every current subscriber.
    pub async fn publish(&self, event: &ClosedCandleEvent) {
        // Snapshot so handlers may (un)subscribe while being called.
        let handlers: Vec<(u64, Arc<dyn CandleEventHandler>)> = lock(&self.handlers).clone();

        for (id, handler) in handlers {
            if let Err(e) = handler.on_candle(event).await {
                error!(
                    event = "candle_handler_failed",
                    subscriber = id,
                    symbol = %event.symbol,
                    timeframe = %event.timeframe,
                    ts = event.candle.timestamp,
                    error = %e,
                    "Candle handler failed"
                );
            }
        }
    }
}

/// Handle returned by [`CandleEventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    handlers: Weak<HandlerList>,
}

impl Subscription {
    /// Remove the handler. Safe to call after the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(handlers) = self.handlers.upgrade() {
            lock(&handlers).retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock(handlers: &HandlerList) -> std::sync::MutexGuard<'_, Vec<(u64, Arc<dyn CandleEventHandler>)>> {
    handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candle, CandleSource, Timeframe};

    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl CandleEventHandler for Recorder {
        async fn on_candle(&self, event: &ClosedCandleEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.candle.timestamp);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CandleEventHandler for Failing {
        async fn on_candle(&self, _event: &ClosedCandleEvent) -> Result<()> {
            anyhow::bail!("subscriber exploded")
        }
    }

    fn event(ts: i64) -> ClosedCandleEvent {
        let candle = Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
            timestamp: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        };
        ClosedCandleEvent {
            venue: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
            candle,
            arrival_delay_ms: 0,
            gap_filled: false,
            source: CandleSource::Ws,
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = CandleEventBus::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let _failing = bus.subscribe(Arc::new(Failing));
        let _rec = bus.subscribe(recorder.clone());

        bus.publish(&event(0)).await;
        bus.publish(&event(60_000)).await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 60_000]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = CandleEventBus::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let sub = bus.subscribe(recorder.clone());
        bus.publish(&event(0)).await;
        sub.unsubscribe();
        bus.publish(&event(60_000)).await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0]);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_after_bus_dropped_is_noop() {
        let bus = CandleEventBus::new();
        let sub = bus.subscribe(Arc::new(Failing));
        drop(bus);
        sub.unsubscribe();
    }
}
