//! Tick snapshot - the read-only multi-timeframe view for one decision tick

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::SnapshotError;
use crate::types::{Candle, CandleSource, Timeframe};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickMeta {
    pub as_of_ts: i64,
    pub tf_ms: BTreeMap<Timeframe, i64>,
    pub arrival_delay_ms: i64,
    pub source_by_tf: BTreeMap<Timeframe, CandleSource>,
    pub gap_filled_by_tf: BTreeMap<Timeframe, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSnapshot {
    pub symbol: String,
    pub signal_venue: String,
    pub execution_timeframe: Timeframe,
    pub execution_candle: Candle,
    pub series: BTreeMap<Timeframe, Vec<Candle>>,
    pub meta: TickMeta,
}

impl TickSnapshot {
    /// Series for `timeframe`, empty if not loaded.
    pub fn candles(&self, timeframe: Timeframe) -> &[Candle] {
        self.series.get(&timeframe).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// How the execution candle arrived.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ArrivalInfo {
    pub arrival_delay_ms: i64,
    pub source: Option<CandleSource>,
    pub gap_filled: bool,
}

/// Validate the execution candle and assemble the snapshot.
///
/// The execution candle must belong to `execution_timeframe` and sit on one
/// of its bucket boundaries. Misalignment points at an upstream boundary bug
/// and is never corrected here.
pub fn build_tick_snapshot(
    symbol: &str,
    venue: &str,
    execution_timeframe: Timeframe,
    execution_candle: Candle,
    series: BTreeMap<Timeframe, Vec<Candle>>,
    arrival: ArrivalInfo,
) -> Result<TickSnapshot, SnapshotError> {
    if execution_candle.timeframe != execution_timeframe {
        return Err(SnapshotError::TimeframeMismatch {
            candle: execution_candle.timeframe,
            expected: execution_timeframe,
        });
    }

    let ts = execution_candle.timestamp;
    let expected = execution_timeframe.bucket_start(ts);
    if expected != ts {
        return Err(SnapshotError::Misaligned {
            timeframe: execution_timeframe,
            timestamp: ts,
            expected,
            offset_ms: ts - expected,
        });
    }

    let tf_ms = std::iter::once(execution_timeframe)
        .chain(series.keys().copied())
        .map(|tf| (tf, tf.duration_ms()))
        .collect();

    let mut source_by_tf = BTreeMap::new();
    if let Some(source) = arrival.source {
        source_by_tf.insert(execution_timeframe, source);
    }
    let gap_filled_by_tf = BTreeMap::from([(execution_timeframe, arrival.gap_filled)]);

    Ok(TickSnapshot {
        symbol: symbol.to_string(),
        signal_venue: venue.to_string(),
        execution_timeframe,
        execution_candle,
        series,
        meta: TickMeta {
            as_of_ts: expected,
            tf_ms,
            arrival_delay_ms: arrival.arrival_delay_ms,
            source_by_tf,
            gap_filled_by_tf,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(tf: Timeframe, ts: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: tf,
            timestamp: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        }
    }

    #[test]
    fn builds_snapshot_with_durations() {
        let series = BTreeMap::from([
            (Timeframe::M5, vec![candle(Timeframe::M5, 0)]),
            (Timeframe::H1, Vec::new()),
        ]);
        let snap = build_tick_snapshot(
            "BTCUSDT",
            "binance",
            Timeframe::M5,
            candle(Timeframe::M5, 300_000),
            series,
            ArrivalInfo {
                arrival_delay_ms: 120,
                source: Some(CandleSource::Ws),
                gap_filled: false,
            },
        )
        .unwrap();

        assert_eq!(snap.meta.as_of_ts, 300_000);
        assert_eq!(snap.meta.tf_ms[&Timeframe::M5], 300_000);
        assert_eq!(snap.meta.tf_ms[&Timeframe::H1], 3_600_000);
        assert_eq!(snap.meta.source_by_tf[&Timeframe::M5], CandleSource::Ws);
        assert_eq!(snap.candles(Timeframe::M5).len(), 1);
        assert!(snap.candles(Timeframe::M15).is_empty());
    }

    #[test]
    fn misaligned_candle_reports_offset() {
        let err = build_tick_snapshot(
            "BTCUSDT",
            "binance",
            Timeframe::M5,
            candle(Timeframe::M5, 301_000),
            BTreeMap::new(),
            ArrivalInfo::default(),
        )
        .unwrap_err();

        assert!(err.to_string().contains("by 1000ms"));
        match err {
            SnapshotError::Misaligned {
                expected, offset_ms, ..
            } => {
                assert_eq!(expected, 300_000);
                assert_eq!(offset_ms, 1_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_timeframe_is_rejected() {
        let err = build_tick_snapshot(
            "BTCUSDT",
            "binance",
            Timeframe::M5,
            candle(Timeframe::M1, 300_000),
            BTreeMap::new(),
            ArrivalInfo::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SnapshotError::TimeframeMismatch { .. }));
    }
}
