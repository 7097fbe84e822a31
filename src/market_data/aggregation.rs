//! Candle aggregation - rolls base candles up into higher timeframe buckets
//!
//! All functions here are pure. The plant decides which buckets just closed
//! with [`detect_closed_buckets`] *before* moving its last-seen boundary, then
//! builds the candles for them with [`aggregate_candle`].

use crate::types::{Candle, Timeframe};

/// A higher timeframe bucket whose end boundary has been crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedBucket {
    pub timeframe: Timeframe,
    pub bucket_timestamp: i64,
}

/// Aggregate every base candle in `[bucket_start, bucket_start + target)`.
///
/// Expects `base_candles` in ascending timestamp order. Returns `None` when
/// no base candle falls inside the bucket.
pub fn aggregate_candle(
    base_candles: &[Candle],
    target: Timeframe,
    bucket_start: i64,
    symbol: &str,
) -> Option<Candle> {
    let bucket_end = bucket_start + target.duration_ms();
    let mut members = base_candles
        .iter()
        .filter(|c| c.timestamp >= bucket_start && c.timestamp < bucket_end);

    let first = members.next()?;
    let mut candle = Candle {
        symbol: symbol.to_string(),
        timeframe: target,
        timestamp: bucket_start,
        open: first.open,
        high: first.high,
        low: first.low,
        close: first.close,
        volume: first.volume,
    };

    for c in members {
        candle.high = candle.high.max(c.high);
        candle.low = candle.low.min(c.low);
        candle.close = c.close;
        candle.volume += c.volume;
    }

    Some(candle)
}

/// Report every target bucket closed by moving from `prev_base_ts` to
/// `current_base_ts`.
///
/// For each timeframe, all buckets from the one containing `prev_base_ts` up
/// to (excluding) the one containing `current_base_ts` are reported, so a
/// large jump closes every elapsed bucket rather than only the last one.
pub fn detect_closed_buckets(
    prev_base_ts: i64,
    current_base_ts: i64,
    targets: &[Timeframe],
) -> Vec<ClosedBucket> {
    let mut closed = Vec::new();
    for &timeframe in targets {
        let prev_bucket = timeframe.bucket_start(prev_base_ts);
        let current_bucket = timeframe.bucket_start(current_base_ts);

        let mut bucket = prev_bucket;
        while bucket < current_bucket {
            closed.push(ClosedBucket {
                timeframe,
                bucket_timestamp: bucket,
            });
            bucket += timeframe.duration_ms();
        }
    }
    closed
}

/// Aggregated candles for every bucket closed between the two base timestamps.
///
/// Buckets with no base candles are skipped. No ordering across timeframes is
/// guaranteed.
pub fn aggregate_newly_closed(
    base_history: &[Candle],
    prev_base_ts: i64,
    current_base_ts: i64,
    targets: &[Timeframe],
    symbol: &str,
) -> Vec<Candle> {
    detect_closed_buckets(prev_base_ts, current_base_ts, targets)
        .into_iter()
        .filter_map(|bucket| {
            aggregate_candle(base_history, bucket.timeframe, bucket.bucket_timestamp, symbol)
        })
        .collect()
}
