// =============================================================================
// Background Ingestion — candle polling, order-book sampling, price ticks
// =============================================================================
//
// Each loop is an independent task with its own cadence; none of them block
// one another and none of them are fatal. Upstream failure degrades to an
// empty batch (the connector already absorbed the retries), the error is
// recorded, and the loop simply runs again on the next tick.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::store::{Candle, OrderBookSnapshot, StoreError};
use crate::venue::{DepthStream, Kline};

/// Map a normalized venue kline onto a candle row. The bucket timestamp is
/// the kline open time.
pub fn kline_to_candle(symbol: &str, timeframe: &str, kline: &Kline) -> Candle {
    Candle {
        symbol: symbol.to_uppercase(),
        timeframe: timeframe.to_string(),
        open: kline.open,
        high: kline.high,
        low: kline.low,
        close: kline.close,
        volume: kline.volume,
        ts: kline.open_time,
    }
}

// ---------------------------------------------------------------------------
// Candle polling
// ---------------------------------------------------------------------------

/// Poll historical candles for every (symbol, timeframe) pair and upsert
/// them in bulk. Re-polling the same buckets overwrites in place.
pub async fn run_candle_loop(state: Arc<AppState>) {
    let period = state.runtime_config.read().candle_poll_secs.max(1);
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(period));

    loop {
        interval.tick().await;

        let (symbols, timeframes, lookback) = {
            let cfg = state.runtime_config.read();
            (cfg.symbols.clone(), cfg.timeframes.clone(), cfg.candle_lookback)
        };

        for symbol in &symbols {
            for timeframe in &timeframes {
                let klines = state
                    .venue
                    .fetch_klines(symbol, timeframe, lookback, None, None)
                    .await;
                if klines.is_empty() {
                    state.push_error(format!("candle poll returned nothing for {symbol} {timeframe}"));
                    continue;
                }

                let rows: Vec<Candle> = klines
                    .iter()
                    .map(|k| kline_to_candle(symbol, timeframe, k))
                    .collect();
                let written = state.store.upsert_candles(rows);
                info!(symbol = %symbol, timeframe = %timeframe, written, "candles upserted");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Order-book sampling (REST)
// ---------------------------------------------------------------------------

/// Sample a REST depth snapshot per symbol at a fixed cadence. The depth
/// stream is the primary feed; this loop keeps snapshots flowing when the
/// stream is rebuilding.
pub async fn run_orderbook_loop(state: Arc<AppState>) {
    let period = state.runtime_config.read().orderbook_poll_secs.max(1);
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(period));

    loop {
        interval.tick().await;

        let (symbols, levels) = {
            let cfg = state.runtime_config.read();
            (cfg.symbols.clone(), cfg.depth_levels)
        };

        for symbol in &symbols {
            let Some(update) = state.venue.fetch_orderbook(symbol, levels).await else {
                state.push_error(format!("orderbook poll failed for {symbol}"));
                continue;
            };
            if update.bids.is_empty() && update.asks.is_empty() {
                continue;
            }

            let ts = update
                .event_time
                .unwrap_or_else(|| Utc::now().timestamp_millis());
            state.store.insert_orderbook_snapshot(OrderBookSnapshot::from_levels(
                symbol,
                update.bids,
                update.asks,
                ts,
            ));
            debug!(symbol = %symbol, "orderbook snapshot stored");
        }
    }
}

// ---------------------------------------------------------------------------
// Order-book streaming (WebSocket)
// ---------------------------------------------------------------------------

/// Consume the depth stream for one symbol forever, persisting every update
/// as a snapshot. Reconnection lives inside [`DepthStream`]; this task only
/// ever awaits the next event.
pub async fn run_depth_stream_task(state: Arc<AppState>, symbol: String) {
    let (ws_url, levels) = {
        let cfg = state.runtime_config.read();
        (cfg.venue_ws_url.clone(), cfg.depth_levels as usize)
    };
    let mut stream = DepthStream::new(&ws_url, &symbol, levels);
    info!(symbol = %symbol, levels, "depth stream task started");

    loop {
        let update = stream.next().await;
        if update.bids.is_empty() && update.asks.is_empty() {
            continue;
        }
        let ts = update
            .event_time
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        state.store.insert_orderbook_snapshot(OrderBookSnapshot::from_levels(
            &symbol,
            update.bids,
            update.asks,
            ts,
        ));
    }
}

// ---------------------------------------------------------------------------
// Price ticks
// ---------------------------------------------------------------------------

/// Poll batched last-trade prices for the tracked symbols and append them as
/// ticks. A duplicate (symbol, ts) is the uniqueness constraint doing its
/// job, not a failure.
pub async fn run_price_loop(state: Arc<AppState>) {
    let period = state.runtime_config.read().price_poll_secs.max(1);
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(period));

    loop {
        interval.tick().await;

        let symbols = state.runtime_config.read().symbols.clone();
        let prices = state.venue.fetch_prices(&symbols).await;
        if prices.is_empty() {
            state.push_error("price poll returned nothing".to_string());
            continue;
        }

        let ts = Utc::now().timestamp_millis();
        for (symbol, price) in prices {
            // Keep the paper exchange marked to the latest observed price.
            state.exchange.set_price(&symbol, price);
            match state.store.insert_price_tick(&symbol, price, ts) {
                Ok(_) => {}
                Err(StoreError::DuplicateTick { .. }) => {
                    debug!(symbol = %symbol, ts, "tick already recorded — skipping");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_maps_onto_candle_bucket() {
        let k = Kline {
            open_time: 1_700_000_000_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 42.0,
            close_time: 1_700_000_059_999,
        };
        let c = kline_to_candle("btcusdt", "1m", &k);
        assert_eq!(c.symbol, "BTCUSDT");
        assert_eq!(c.timeframe, "1m");
        assert_eq!(c.ts, 1_700_000_000_000);
        assert!((c.close - 1.5).abs() < f64::EPSILON);
        assert!((c.volume - 42.0).abs() < f64::EPSILON);
    }
}
