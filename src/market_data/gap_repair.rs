//! Gap repair - fetches candles missing between two observed timestamps
//!
//! Knows nothing about venues or sources: given a fetch callback it returns
//! the sorted, deduplicated candles inside the missing range.

use anyhow::Result;
use std::future::Future;
use tracing::debug;

use crate::types::{Candle, Timeframe};

/// Outcome of a gap repair attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct GapRepairResult {
    /// Sorted, deduplicated, clipped to `[from_ts, to_ts)`
    pub missing: Vec<Candle>,
    pub gap_size: usize,
    pub from_ts: i64,
    pub to_ts: i64,
}

/// Number of whole buckets missing strictly between `last_ts` and `next_ts`.
pub fn gap_size(timeframe: Timeframe, last_ts: i64, next_ts: i64) -> usize {
    let steps = (next_ts - last_ts).div_euclid(timeframe.duration_ms());
    (steps - 1).max(0) as usize
}

/// Repair the gap between `last_ts` and `next_ts`.
///
/// `fetch_candles` is called with `from_ts = last_ts + tf` only when at least
/// one bucket is missing.
pub async fn repair_candle_gap<F, Fut>(
    timeframe: Timeframe,
    last_ts: i64,
    next_ts: i64,
    fetch_candles: F,
) -> Result<GapRepairResult>
where
    F: FnOnce(i64) -> Fut,
    Fut: Future<Output = Result<Vec<Candle>>>,
{
    let from_ts = last_ts + timeframe.duration_ms();
    let size = gap_size(timeframe, last_ts, next_ts);

    if size == 0 {
        return Ok(GapRepairResult {
            missing: Vec::new(),
            gap_size: 0,
            from_ts,
            to_ts: next_ts,
        });
    }

    let fetched = fetch_candles(from_ts).await?;
    let fetched_count = fetched.len();

    let mut missing: Vec<Candle> = fetched
        .into_iter()
        .map(|mut c| {
            c.timestamp = timeframe.bucket_start(c.timestamp);
            c
        })
        .filter(|c| c.timestamp >= from_ts && c.timestamp < next_ts)
        .collect();

    // Stable sort keeps the fetch order among equal timestamps, so dedup
    // retains the first occurrence.
    missing.sort_by_key(|c| c.timestamp);
    missing.dedup_by_key(|c| c.timestamp);

    debug!(
        timeframe = %timeframe,
        gap_size = size,
        fetched = fetched_count,
        repaired = missing.len(),
        from_ts,
        to_ts = next_ts,
        "Gap repair fetch completed"
    );

    Ok(GapRepairResult {
        missing,
        gap_size: size,
        from_ts,
        to_ts: next_ts,
    })
}
