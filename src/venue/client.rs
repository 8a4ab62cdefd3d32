// =============================================================================
// Venue REST Client — normalized market-data access with uniform retries
// =============================================================================
//
// Every public fetch degrades to an empty result after MAX_ATTEMPTS failed
// tries; no venue error ever crosses this boundary. Rate-limit responses are
// classified separately from generic transient failures but share the same
// capped backoff schedule.
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::venue::backoff::Backoff;
use crate::venue::stream::{parse_depth_payload, DepthUpdate};

/// Maximum attempts per REST request before giving up.
const MAX_ATTEMPTS: u32 = 5;
/// Venue-imposed ceiling on kline batch size.
const MAX_KLINE_LIMIT: u32 = 1000;
/// Venue-imposed ceiling on depth levels per snapshot.
const MAX_DEPTH_LIMIT: u32 = 5000;
/// Maximum symbols per batched 24h-ticker request.
const STATS_BATCH_SIZE: usize = 100;

/// Leveraged-token suffixes excluded from the tradable universe.
const EXCLUDE_SUFFIXES: [&str; 4] = ["UPUSDT", "DOWNUSDT", "BULLUSDT", "BEARUSDT"];

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Internal error taxonomy for a single request attempt. Never escapes the
/// client: exhausted retries become empty results.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Connection failure, timeout, or a non-429 error status.
    #[error("transient venue error: {0}")]
    Transient(String),
    /// HTTP 429 — retried with the same backoff as transient failures.
    #[error("rate limited by venue: {0}")]
    RateLimited(String),
    /// Response body that could not be decoded as JSON.
    #[error("malformed venue payload: {0}")]
    MalformedPayload(String),
}

// ---------------------------------------------------------------------------
// Normalized record types
// ---------------------------------------------------------------------------

/// A single OHLCV candle normalized from the venue's array-of-arrays format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// One row of the venue's 24-hour ticker statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerStats {
    pub symbol: String,
    #[serde(rename = "lastPrice")]
    pub last_price: f64,
    #[serde(rename = "highPrice")]
    pub high_price: f64,
    #[serde(rename = "lowPrice")]
    pub low_price: f64,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: f64,
    #[serde(rename = "quoteVolume")]
    pub quote_volume: f64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// REST client for the trading venue. Cheap to clone; the inner reqwest
/// client pools connections.
#[derive(Clone)]
pub struct VenueClient {
    base_url: String,
    http: reqwest::Client,
}

impl VenueClient {
    /// Build a client against `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, timeout_secs, "VenueClient initialised");

        Self { base_url, http }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// One GET attempt, classified into the [`VenueError`] taxonomy.
    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, VenueError> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| VenueError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(VenueError::RateLimited(format!("GET {path} returned 429")));
        }
        if !status.is_success() {
            return Err(VenueError::Transient(format!(
                "GET {path} returned {status}"
            )));
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| VenueError::MalformedPayload(e.to_string()))
    }

    /// GET with up to [`MAX_ATTEMPTS`] tries and capped exponential backoff
    /// between failures. Returns `None` once the attempts are exhausted.
    async fn get_json_retrying(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Option<serde_json::Value> {
        let mut backoff = Backoff::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.get_json(path, query).await {
                Ok(value) => return Some(value),
                Err(VenueError::RateLimited(msg)) => {
                    warn!(path, attempt, %msg, "venue rate limit hit — backing off");
                }
                Err(e) => {
                    warn!(path, attempt, error = %e, "venue request failed — backing off");
                }
            }
            if attempt < MAX_ATTEMPTS {
                backoff.sleep().await;
            }
        }

        warn!(path, attempts = MAX_ATTEMPTS, "venue request exhausted retries");
        None
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// Fetch historical klines, oldest first. Returns an empty vec if the
    /// venue stays unreachable; malformed rows are skipped individually.
    #[instrument(skip(self), name = "venue::fetch_klines")]
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Vec<Kline> {
        let mut query = vec![
            ("symbol", symbol.to_uppercase()),
            ("interval", interval.to_string()),
            ("limit", limit.min(MAX_KLINE_LIMIT).to_string()),
        ];
        if let Some(start) = start_time {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_time {
            query.push(("endTime", end.to_string()));
        }

        let Some(body) = self.get_json_retrying("/api/v3/klines", &query).await else {
            return Vec::new();
        };

        let Some(raw) = body.as_array() else {
            warn!(symbol, "klines response is not an array");
            return Vec::new();
        };

        let mut klines = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_kline(entry) {
                Some(k) => klines.push(k),
                None => warn!(symbol, interval, "skipping malformed kline entry"),
            }
        }

        debug!(symbol, interval, count = klines.len(), "klines fetched");
        klines
    }

    // -------------------------------------------------------------------------
    // Order book
    // -------------------------------------------------------------------------

    /// Fetch a single depth snapshot over REST. `None` on exhausted retries
    /// or an undecodable payload.
    #[instrument(skip(self), name = "venue::fetch_orderbook")]
    pub async fn fetch_orderbook(&self, symbol: &str, depth: u32) -> Option<DepthUpdate> {
        let query = vec![
            ("symbol", symbol.to_uppercase()),
            ("limit", depth.min(MAX_DEPTH_LIMIT).to_string()),
        ];

        let body = self.get_json_retrying("/api/v3/depth", &query).await?;
        let snapshot = parse_depth_payload(&body, depth as usize);
        if snapshot.is_none() {
            warn!(symbol, "depth response missing bid/ask arrays");
        }
        snapshot
    }

    // -------------------------------------------------------------------------
    // Universe
    // -------------------------------------------------------------------------

    /// Fetch the tradable instrument universe: spot USDT pairs currently
    /// trading, leveraged tokens excluded. Empty vec on failure — the caller
    /// owns the fallback.
    #[instrument(skip(self), name = "venue::fetch_universe")]
    pub async fn fetch_universe(&self) -> Vec<String> {
        let Some(body) = self.get_json_retrying("/api/v3/exchangeInfo", &[]).await else {
            return Vec::new();
        };

        let Some(entries) = body.get("symbols").and_then(|v| v.as_array()) else {
            warn!("exchangeInfo response missing 'symbols' array");
            return Vec::new();
        };

        let mut out = Vec::new();
        for entry in entries {
            if entry.get("status").and_then(|v| v.as_str()) != Some("TRADING") {
                continue;
            }
            if entry.get("quoteAsset").and_then(|v| v.as_str()) != Some("USDT") {
                continue;
            }
            // Some venue gateways omit 'permissions'; spot-allowed is enough then.
            if let Some(perms) = entry.get("permissions").and_then(|v| v.as_array()) {
                if !perms.iter().any(|p| p.as_str() == Some("SPOT")) {
                    continue;
                }
            }
            if !entry
                .get("isSpotTradingAllowed")
                .and_then(|v| v.as_bool())
                .unwrap_or(true)
            {
                continue;
            }
            let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            if EXCLUDE_SUFFIXES.iter().any(|sfx| symbol.ends_with(sfx)) {
                continue;
            }
            out.push(symbol.to_string());
        }

        debug!(count = out.len(), "universe fetched");
        out
    }

    // -------------------------------------------------------------------------
    // 24h statistics
    // -------------------------------------------------------------------------

    /// Fetch 24-hour ticker statistics for `symbols`, batched to respect the
    /// venue's request-size limit. Empty vec if any batch fails.
    #[instrument(skip(self, symbols), name = "venue::fetch_24h_stats")]
    pub async fn fetch_24h_stats(&self, symbols: &[String]) -> Vec<TickerStats> {
        if symbols.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(symbols.len());
        for chunk in symbols.chunks(STATS_BATCH_SIZE) {
            let query = vec![("symbols", symbol_list_param(chunk))];
            let Some(body) = self.get_json_retrying("/api/v3/ticker/24hr", &query).await
            else {
                return Vec::new();
            };
            let Some(rows) = body.as_array() else {
                // Some gateways answer with an error object; treat as failure.
                return Vec::new();
            };
            for row in rows {
                if let Some(stats) = parse_ticker_stats(row) {
                    out.push(stats);
                }
            }
        }

        debug!(requested = symbols.len(), received = out.len(), "24h stats fetched");
        out
    }

    // -------------------------------------------------------------------------
    // Last-trade prices
    // -------------------------------------------------------------------------

    /// Fetch last-trade prices for `symbols` in one batched request.
    #[instrument(skip(self, symbols), name = "venue::fetch_prices")]
    pub async fn fetch_prices(&self, symbols: &[String]) -> Vec<(String, f64)> {
        if symbols.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(symbols.len());
        for chunk in symbols.chunks(STATS_BATCH_SIZE) {
            let query = vec![("symbols", symbol_list_param(chunk))];
            let Some(body) = self.get_json_retrying("/api/v3/ticker/price", &query).await
            else {
                return Vec::new();
            };
            let Some(rows) = body.as_array() else {
                return Vec::new();
            };
            for row in rows {
                let Some(symbol) = row.get("symbol").and_then(|v| v.as_str()) else {
                    continue;
                };
                match row.get("price").map(parse_str_f64) {
                    Some(Some(price)) => out.push((symbol.to_string(), price)),
                    _ => warn!(symbol, "skipping ticker price with unparseable field"),
                }
            }
        }
        out
    }

    /// Last-trade price for a single instrument.
    pub async fn fetch_ticker_price(&self, symbol: &str) -> Option<f64> {
        let query = vec![("symbol", symbol.to_uppercase())];
        let body = self.get_json_retrying("/api/v3/ticker/price", &query).await?;
        body.get("price").and_then(parse_str_f64)
    }
}

impl std::fmt::Debug for VenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
/// The venue sends most numeric fields as strings.
fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Lenient variant used for statistics rows: garbled fields become 0.0
/// rather than dropping the row.
fn parse_f64_or_zero(val: Option<&serde_json::Value>) -> f64 {
    val.and_then(parse_str_f64).unwrap_or(0.0)
}

/// Normalize one kline entry from the venue's array format.
///
/// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume, [6] closeTime (further fields unused).
fn parse_kline(entry: &serde_json::Value) -> Option<Kline> {
    let arr = entry.as_array()?;
    if arr.len() < 7 {
        return None;
    }
    Some(Kline {
        open_time: arr[0].as_i64()?,
        open: parse_str_f64(&arr[1])?,
        high: parse_str_f64(&arr[2])?,
        low: parse_str_f64(&arr[3])?,
        close: parse_str_f64(&arr[4])?,
        volume: parse_str_f64(&arr[5])?,
        close_time: arr[6].as_i64()?,
    })
}

/// Normalize one 24h-ticker row. Rows without a symbol are dropped; numeric
/// fields degrade to 0.0 individually.
fn parse_ticker_stats(row: &serde_json::Value) -> Option<TickerStats> {
    let symbol = row.get("symbol").and_then(|v| v.as_str())?;
    Some(TickerStats {
        symbol: symbol.to_string(),
        last_price: parse_f64_or_zero(row.get("lastPrice")),
        high_price: parse_f64_or_zero(row.get("highPrice")),
        low_price: parse_f64_or_zero(row.get("lowPrice")),
        price_change_percent: parse_f64_or_zero(row.get("priceChangePercent")),
        quote_volume: parse_f64_or_zero(row.get("quoteVolume")),
    })
}

/// Encode a symbol list the way the venue expects: `["BTCUSDT","ETHUSDT"]`.
fn symbol_list_param(symbols: &[String]) -> String {
    let quoted: Vec<String> = symbols.iter().map(|s| format!("\"{s}\"")).collect();
    format!("[{}]", quoted.join(","))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kline_ok() {
        let entry: serde_json::Value = serde_json::json!([
            1700000000000i64,
            "37000.00",
            "37050.00",
            "36990.00",
            "37020.00",
            "123.456",
            1700000059999i64,
            "4567890.12",
            1500,
            "60.123",
            "2224455.66"
        ]);
        let k = parse_kline(&entry).expect("should parse");
        assert_eq!(k.open_time, 1_700_000_000_000);
        assert_eq!(k.close_time, 1_700_000_059_999);
        assert!((k.close - 37_020.0).abs() < f64::EPSILON);
        assert!((k.volume - 123.456).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_kline_rejects_short_and_garbled_entries() {
        let short: serde_json::Value = serde_json::json!([1700000000000i64, "1.0"]);
        assert!(parse_kline(&short).is_none());

        let garbled: serde_json::Value = serde_json::json!([
            1700000000000i64,
            "not-a-number",
            "2.0",
            "0.5",
            "1.5",
            "10.0",
            1700000059999i64
        ]);
        assert!(parse_kline(&garbled).is_none());
    }

    #[test]
    fn parse_ticker_stats_tolerates_bad_numeric_fields() {
        let row = serde_json::json!({
            "symbol": "BTCUSDT",
            "lastPrice": "37000.5",
            "highPrice": "garbage",
            "priceChangePercent": "-1.25",
            "quoteVolume": 1234.5
        });
        let stats = parse_ticker_stats(&row).expect("row has a symbol");
        assert_eq!(stats.symbol, "BTCUSDT");
        assert!((stats.last_price - 37_000.5).abs() < f64::EPSILON);
        assert_eq!(stats.high_price, 0.0);
        assert_eq!(stats.low_price, 0.0);
        assert!((stats.price_change_percent + 1.25).abs() < f64::EPSILON);
        assert!((stats.quote_volume - 1234.5).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_ticker_stats_drops_rows_without_symbol() {
        let row = serde_json::json!({ "lastPrice": "1.0" });
        assert!(parse_ticker_stats(&row).is_none());
    }

    #[test]
    fn symbol_list_param_matches_venue_encoding() {
        let syms = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        assert_eq!(symbol_list_param(&syms), r#"["BTCUSDT","ETHUSDT"]"#);
    }
}
