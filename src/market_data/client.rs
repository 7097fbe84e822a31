//! REST market data clients
//!
//! `MarketDataClient` is what the plant uses for bootstrap and gap repair.
//! Ships with a Binance USD-M futures kline client and an in-memory client
//! serving a fixed candle set (backtests, tests).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::types::{Candle, Timeframe};

pub const BINANCE_FUTURES_REST_URL: &str = "https://fapi.binance.com";
/// Binance caps kline requests at 1500 rows
const BINANCE_MAX_LIMIT: usize = 1500;

/// Historical OHLCV source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    /// Up to `limit` candles, ascending. With `since`, starts at the first
    /// candle whose timestamp is `>= since`; otherwise returns the latest.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        since: Option<i64>,
    ) -> Result<Vec<Candle>>;
}

/// Binance futures `/fapi/v1/klines` client.
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
}

impl BinanceRestClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketDataClient for BinanceRestClient {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, BINANCE_MAX_LIMIT);
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            timeframe,
            limit
        );
        if let Some(since) = since {
            url.push_str(&format!("&startTime={}", since));
        }

        tracing::debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            limit,
            since = ?since,
            "📥 Fetching klines from Binance"
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch klines from Binance")?;

        if !response.status().is_success() {
            bail!("Binance API returned error: {}", response.status());
        }

        // [[open_time, open, high, low, close, volume, close_time, ...], ...]
        let klines: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse Binance klines response")?;

        Ok(parse_klines(symbol, timeframe, &klines))
    }
}

/// Parse Binance's array-of-arrays kline format, skipping malformed rows.
pub fn parse_klines(symbol: &str, timeframe: Timeframe, rows: &[Vec<serde_json::Value>]) -> Vec<Candle> {
    let mut candles: Vec<Candle> = rows
        .iter()
        .filter_map(|row| {
            if row.len() < 6 {
                return None;
            }
            Some(Candle {
                symbol: symbol.to_uppercase(),
                timeframe,
                timestamp: row[0].as_i64()?,
                open: json_f64(&row[1])?,
                high: json_f64(&row[2])?,
                low: json_f64(&row[3])?,
                close: json_f64(&row[4])?,
                volume: json_f64(&row[5])?,
            })
        })
        .collect();
    candles.sort_by_key(|c| c.timestamp);
    candles
}

/// Binance encodes decimals as strings; accept plain numbers too.
pub(crate) fn json_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Serves a fixed, pre-loaded candle set with the same query semantics as
/// the exchange client.
#[derive(Debug, Clone, Default)]
pub struct HistoricalCandleClient {
    candles: Vec<Candle>,
}

impl HistoricalCandleClient {
    pub fn new(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.timestamp);
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[async_trait]
impl MarketDataClient for HistoricalCandleClient {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let matching = self
            .candles
            .iter()
            .filter(|c| c.timeframe == timeframe && c.symbol.eq_ignore_ascii_case(symbol));

        let out: Vec<Candle> = match since {
            Some(since) => matching
                .filter(|c| c.timestamp >= since)
                .take(limit)
                .cloned()
                .collect(),
            None => {
                let all: Vec<&Candle> = matching.collect();
                let skip = all.len().saturating_sub(limit);
                all.into_iter().skip(skip).cloned().collect()
            }
        };
        Ok(out)
    }
}
