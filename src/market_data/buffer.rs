//! Per-timeframe candle buffer owned by the market data plant
//!
//! Only the plant's processing path writes to it. Everyone else gets a
//! [`CandleHistoryView`] that hands out cloned candles.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{Candle, Timeframe};

/// Bounded, ascending candle history per timeframe.
#[derive(Debug)]
pub struct CandleBuffer {
    series: HashMap<Timeframe, VecDeque<Candle>>,
    capacity: usize,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a candle, keeping ascending order. A candle with an existing
    /// timestamp replaces the stored one.
    pub fn ingest(&mut self, candle: Candle) {
        let history = self
            .series
            .entry(candle.timeframe)
            .or_insert_with(VecDeque::new);

        match history.back() {
            None => history.push_back(candle),
            Some(last) if candle.timestamp > last.timestamp => history.push_back(candle),
            _ => match history.binary_search_by_key(&candle.timestamp, |c| c.timestamp) {
                Ok(idx) => history[idx] = candle,
                Err(idx) => history.insert(idx, candle),
            },
        }

        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    pub fn ingest_all(&mut self, candles: impl IntoIterator<Item = Candle>) {
        for candle in candles {
            self.ingest(candle);
        }
    }

    /// Full stored history for a timeframe, oldest first.
    pub fn all(&self, timeframe: Timeframe) -> Vec<Candle> {
        self.series
            .get(&timeframe)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last `limit` candles with `timestamp <= as_of`, oldest first.
    pub fn history_until(&self, timeframe: Timeframe, as_of: i64, limit: usize) -> Vec<Candle> {
        let Some(history) = self.series.get(&timeframe) else {
            return Vec::new();
        };
        let mut out: Vec<Candle> = history
            .iter()
            .rev()
            .filter(|c| c.timestamp <= as_of)
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    pub fn latest(&self, timeframe: Timeframe) -> Option<Candle> {
        self.series.get(&timeframe).and_then(|h| h.back().cloned())
    }

    pub fn len(&self, timeframe: Timeframe) -> usize {
        self.series.get(&timeframe).map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(|h| h.is_empty())
    }
}

/// Shared handle to the plant's buffer.
#[derive(Debug, Clone)]
pub(crate) struct SharedCandleBuffer(Arc<RwLock<CandleBuffer>>);

impl SharedCandleBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self(Arc::new(RwLock::new(CandleBuffer::new(capacity))))
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, CandleBuffer> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, CandleBuffer> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn view(&self) -> CandleHistoryView {
        CandleHistoryView {
            inner: self.clone(),
        }
    }
}

/// Read-only access to the plant's candle buffer.
#[derive(Debug, Clone)]
pub struct CandleHistoryView {
    inner: SharedCandleBuffer,
}

impl CandleHistoryView {
    /// Last `limit` candles at or before `as_of`, oldest first.
    pub fn history_until(&self, timeframe: Timeframe, as_of: i64, limit: usize) -> Vec<Candle> {
        self.inner.read().history_until(timeframe, as_of, limit)
    }

    pub fn latest(&self, timeframe: Timeframe) -> Option<Candle> {
        self.inner.read().latest(timeframe)
    }

    pub fn len(&self, timeframe: Timeframe) -> usize {
        self.inner.read().len(timeframe)
    }
}
