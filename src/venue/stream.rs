// =============================================================================
// Depth WebSocket Stream — infinite, self-healing depth-update sequence
// =============================================================================
//
// `DepthStream::next()` is the consumer-facing contract: it only ever
// resolves with the next parsed update. Connection loss, handshake failures,
// and malformed frames are absorbed internally — the stream sleeps the
// shared capped backoff and reconnects, indefinitely.
// =============================================================================

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::venue::backoff::Backoff;

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ---------------------------------------------------------------------------
// Data type
// ---------------------------------------------------------------------------

/// One normalized depth update: price/quantity level pairs, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
    /// Venue event time in epoch milliseconds, when present.
    pub event_time: Option<i64>,
    pub last_update_id: Option<u64>,
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// A long-lived subscription to the venue's partial-depth stream for one
/// instrument. Create once, then call [`DepthStream::next`] forever.
pub struct DepthStream {
    symbol: String,
    levels: usize,
    url: String,
    backoff: Backoff,
    read: Option<WsRead>,
}

impl DepthStream {
    /// Subscribe to `levels` of depth for `symbol` at the 100ms cadence.
    pub fn new(ws_base_url: &str, symbol: &str, levels: usize) -> Self {
        let lower = symbol.to_lowercase();
        let url = format!(
            "{}/ws/{lower}@depth{levels}@100ms",
            ws_base_url.trim_end_matches('/')
        );
        Self {
            symbol: symbol.to_uppercase(),
            levels,
            url,
            backoff: Backoff::new(),
            read: None,
        }
    }

    /// Await the next depth update. Never returns an error and never
    /// terminates: disconnects trigger a backoff sleep and a reconnect.
    pub async fn next(&mut self) -> DepthUpdate {
        loop {
            if self.read.is_none() {
                self.connect().await;
            }
            let Some(read) = self.read.as_mut() else {
                continue;
            };

            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(root) => {
                            if let Some(update) = parse_depth_payload(&root, self.levels) {
                                return update;
                            }
                            warn!(symbol = %self.symbol, "depth frame missing bid/ask arrays");
                        }
                        Err(e) => {
                            warn!(symbol = %self.symbol, error = %e, "failed to parse depth frame");
                        }
                    }
                }
                // Ping/Pong/Binary frames are ignored; tungstenite answers
                // pings automatically.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(symbol = %self.symbol, error = %e, "depth WebSocket read error");
                    self.read = None;
                    self.backoff.sleep().await;
                }
                None => {
                    warn!(symbol = %self.symbol, "depth WebSocket stream ended");
                    self.read = None;
                    self.backoff.sleep().await;
                }
            }
        }
    }

    /// Establish the WebSocket connection, retrying with backoff until it
    /// succeeds. A successful connect resets the backoff schedule.
    async fn connect(&mut self) {
        loop {
            info!(symbol = %self.symbol, url = %self.url, "connecting to depth WebSocket");
            match connect_async(&self.url).await {
                Ok((ws_stream, _response)) => {
                    info!(symbol = %self.symbol, "depth WebSocket connected");
                    self.backoff.reset();
                    let (_write, read) = ws_stream.split();
                    self.read = Some(read);
                    return;
                }
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "depth WebSocket connect failed");
                    self.backoff.sleep().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for DepthStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepthStream")
            .field("symbol", &self.symbol)
            .field("levels", &self.levels)
            .field("connected", &self.read.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Payload parsing (shared with the REST depth snapshot)
// ---------------------------------------------------------------------------

/// Parse a depth payload into level pairs, truncated to `levels` per side.
///
/// Expected shape (both the REST snapshot and the partial-depth stream):
/// ```json
/// { "lastUpdateId": 12345, "bids": [["37000.00", "1.5"], ...], "asks": [...] }
/// ```
/// Returns `None` when the payload carries neither a bids nor an asks array.
/// Individual malformed levels are dropped, not fatal.
pub fn parse_depth_payload(root: &serde_json::Value, levels: usize) -> Option<DepthUpdate> {
    let bids_raw = root.get("bids").and_then(|v| v.as_array());
    let asks_raw = root.get("asks").and_then(|v| v.as_array());
    if bids_raw.is_none() && asks_raw.is_none() {
        return None;
    }

    let event_time = root.get("E").and_then(|v| v.as_i64());
    let last_update_id = root
        .get("u")
        .and_then(|v| v.as_u64())
        .or_else(|| root.get("lastUpdateId").and_then(|v| v.as_u64()));

    Some(DepthUpdate {
        bids: parse_levels(bids_raw, levels),
        asks: parse_levels(asks_raw, levels),
        event_time,
        last_update_id,
    })
}

/// Parse `[["price","qty"], ...]` into `[f64; 2]` pairs, skipping levels
/// that fail to parse.
fn parse_levels(raw: Option<&Vec<serde_json::Value>>, levels: usize) -> Vec<[f64; 2]> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.iter()
        .take(levels)
        .filter_map(|level| {
            let pair = level.as_array()?;
            let price = parse_level_f64(pair.first()?)?;
            let qty = parse_level_f64(pair.get(1)?)?;
            Some([price, qty])
        })
        .collect()
}

fn parse_level_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_depth_payload_ok() {
        let root = serde_json::json!({
            "lastUpdateId": 12345u64,
            "bids": [["37000.00", "1.5"], ["36999.00", "2.0"]],
            "asks": [["37001.00", "1.2"]]
        });
        let update = parse_depth_payload(&root, 20).expect("should parse");
        assert_eq!(update.bids, vec![[37_000.0, 1.5], [36_999.0, 2.0]]);
        assert_eq!(update.asks, vec![[37_001.0, 1.2]]);
        assert_eq!(update.last_update_id, Some(12345));
        assert_eq!(update.event_time, None);
    }

    #[test]
    fn parse_depth_payload_truncates_to_levels() {
        let root = serde_json::json!({
            "bids": [["3.0", "1"], ["2.0", "1"], ["1.0", "1"]],
            "asks": []
        });
        let update = parse_depth_payload(&root, 2).expect("should parse");
        assert_eq!(update.bids.len(), 2);
        assert_eq!(update.bids[0], [3.0, 1.0]);
    }

    #[test]
    fn parse_depth_payload_requires_a_side() {
        let root = serde_json::json!({ "e": "trade", "p": "37000" });
        assert!(parse_depth_payload(&root, 20).is_none());
    }

    #[test]
    fn parse_depth_payload_prefers_stream_update_id() {
        let root = serde_json::json!({
            "E": 1700000000123i64,
            "u": 99u64,
            "lastUpdateId": 12u64,
            "bids": [["1.0", "1.0"]],
            "asks": [["1.1", "1.0"]]
        });
        let update = parse_depth_payload(&root, 20).expect("should parse");
        assert_eq!(update.last_update_id, Some(99));
        assert_eq!(update.event_time, Some(1_700_000_000_123));
    }

    #[test]
    fn malformed_levels_are_dropped() {
        let root = serde_json::json!({
            "bids": [["37000.00", "1.5"], ["oops"], ["x", "y"]],
            "asks": [["37001.00", "1.2"]]
        });
        let update = parse_depth_payload(&root, 20).expect("should parse");
        assert_eq!(update.bids.len(), 1);
        assert_eq!(update.asks.len(), 1);
    }
}
