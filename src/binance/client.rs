// =============================================================================
// Binance REST Market Feed — public endpoints only, no signing
// =============================================================================
//
// Endpoints:
//   GET /api/v3/exchangeInfo?symbol=   symbol validation
//   GET /api/v3/trades?limit=1         latest trade as the polled tick
//   GET /api/v3/klines                 history, by time range or by depth
//
// Kline requests are capped at 1 000 rows by the exchange, so range and depth
// requests are paged.  All exchange timestamps are milliseconds and are
// converted to epoch seconds here.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::error::FeedError;
use crate::market_data::MarketFeed;
use crate::types::{Bar, Tick, Timeframe};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Exchange cap on rows per kline request.
const KLINE_PAGE_LIMIT: usize = 1000;

/// Binance spot market data over REST.
#[derive(Clone)]
pub struct BinanceFeed {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFeed {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(base_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        debug!(base_url = %base_url, "BinanceFeed initialised");
        Ok(Self { base_url, client })
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    async fn get_json(&self, path: &str, query: &str) -> Result<(StatusCode, serde_json::Value)> {
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        Ok((status, body))
    }

    /// One page of klines. `start`/`end` are epoch seconds.
    async fn kline_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Bar>, FeedError> {
        let mut query = format!(
            "symbol={}&interval={}&limit={}",
            symbol,
            timeframe.exchange_interval(),
            limit.clamp(1, KLINE_PAGE_LIMIT)
        );
        if let Some(start) = start {
            query.push_str(&format!("&startTime={}", start * 1000));
        }
        if let Some(end) = end {
            query.push_str(&format!("&endTime={}", end * 1000));
        }

        let (status, body) = self.get_json("/api/v3/klines", &query).await?;
        if !status.is_success() {
            return Err(FeedError::Unavailable(format!(
                "GET /api/v3/klines returned {status}: {body}"
            )));
        }

        parse_klines(&body).map_err(|e| FeedError::Malformed(format!("{e:#}")))
    }
}

#[async_trait]
impl MarketFeed for BinanceFeed {
    #[instrument(skip(self), name = "binance::select_symbol")]
    async fn select_symbol(&self, symbol: &str) -> Result<bool, FeedError> {
        let (status, body) = self
            .get_json("/api/v3/exchangeInfo", &format!("symbol={symbol}"))
            .await?;

        // Unknown symbols come back as 400 with code -1121.
        if status == StatusCode::BAD_REQUEST {
            debug!(symbol, body = %body, "symbol unknown to exchange");
            return Ok(false);
        }
        if !status.is_success() {
            return Err(FeedError::Unavailable(format!(
                "GET /api/v3/exchangeInfo returned {status}: {body}"
            )));
        }

        let trading = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .map(|info| info["status"].as_str() == Some("TRADING"))
            .unwrap_or(false);

        debug!(symbol, trading, "symbol info retrieved");
        Ok(trading)
    }

    async fn latest_tick(&self, symbol: &str) -> Result<Option<Tick>, FeedError> {
        let (status, body) = self
            .get_json("/api/v3/trades", &format!("symbol={symbol}&limit=1"))
            .await?;

        if !status.is_success() {
            return Err(FeedError::Unavailable(format!(
                "GET /api/v3/trades returned {status}: {body}"
            )));
        }

        parse_latest_trade(&body).map_err(|e| FeedError::Malformed(format!("{e:#}")))
    }

    #[instrument(skip(self), name = "binance::historical_range")]
    async fn historical_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Bar>, FeedError> {
        let width = timeframe.seconds();
        let mut bars: Vec<Bar> = Vec::new();
        let mut cursor = start;

        while cursor <= end {
            let page = self
                .kline_page(symbol, timeframe, Some(cursor), Some(end), KLINE_PAGE_LIMIT)
                .await?;
            let full = page.len() >= KLINE_PAGE_LIMIT;
            let Some(last) = page.last().map(|b| b.time) else {
                break;
            };
            bars.extend(page);
            if !full {
                break;
            }
            cursor = last + width;
        }

        debug!(symbol, %timeframe, count = bars.len(), "range klines fetched");
        Ok(bars)
    }

    #[instrument(skip(self), name = "binance::historical_depth")]
    async fn historical_depth(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, FeedError> {
        let mut bars: Vec<Bar> = Vec::with_capacity(count);
        let mut end: Option<i64> = None;

        while bars.len() < count {
            let want = (count - bars.len()).min(KLINE_PAGE_LIMIT);
            let mut page = self.kline_page(symbol, timeframe, None, end, want).await?;
            let Some(first) = page.first().map(|b| b.time) else {
                break;
            };
            let short = page.len() < want;
            page.append(&mut bars);
            bars = page;
            if short {
                break;
            }
            end = Some(first - 1);
        }

        debug!(symbol, %timeframe, count = bars.len(), "depth klines fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for BinanceFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFeed")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Parse Binance's array-of-arrays kline response.
///
/// Array indices:
///   [0] openTime (ms), [1] open, [2] high, [3] low, [4] close, [5] volume
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Bar>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut bars = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;

        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let open_time = arr[0].as_i64().context("kline open time is not an integer")?;
        bars.push(Bar {
            time: open_time.div_euclid(1000),
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }

    Ok(bars)
}

/// Parse the single-element `/api/v3/trades` response into a tick.
fn parse_latest_trade(body: &serde_json::Value) -> Result<Option<Tick>> {
    let trades = body.as_array().context("trades response is not an array")?;
    let Some(trade) = trades.last() else {
        return Ok(None);
    };

    let time_ms = trade["time"].as_i64().context("trade time is not an integer")?;
    Ok(Some(Tick {
        time: time_ms.div_euclid(1000),
        price: parse_str_f64(&trade["price"])?,
        volume: parse_str_f64(&trade["qty"])?,
    }))
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}
