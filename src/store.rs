// =============================================================================
// Time-Series Store — idempotent market-data persistence
// =============================================================================
//
// The single writer of historical market data: price ticks, OHLCV candles,
// and order-book snapshots. Uniqueness contracts:
//   - candles   upsert keyed (symbol, timeframe, bucket ts) — overwrite, never
//     duplicate
//   - ticks     append-only, unique (symbol, ts) — duplicates are rejected
//   - orderbook append-only
//
// Each series is trimmed to a retention cap so memory stays bounded under
// indefinite ingestion. All collections sit behind parking_lot::RwLock; reads
// return cloned snapshots.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A single observed price for an instrument. Unique on (symbol, ts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    /// Epoch milliseconds.
    pub ts: i64,
}

/// One OHLCV bucket. Unique on (symbol, timeframe, ts); re-ingestion of the
/// same bucket overwrites the OHLCV fields in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bucket open time, epoch milliseconds.
    pub ts: i64,
}

/// Composite key identifying a candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// A point-in-time order-book snapshot with derived imbalance and spread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
    pub imbalance: f64,
    pub spread: f64,
    /// Epoch milliseconds.
    pub ts: i64,
}

impl OrderBookSnapshot {
    /// Build a snapshot from raw levels, deriving imbalance and spread.
    ///
    /// imbalance = (bid_vol - ask_vol) / (bid_vol + ask_vol), 0 when both
    /// sides are empty; spread = max(0, best_ask - best_bid), 0 when either
    /// side is empty.
    pub fn from_levels(
        symbol: impl Into<String>,
        bids: Vec<[f64; 2]>,
        asks: Vec<[f64; 2]>,
        ts: i64,
    ) -> Self {
        let bid_vol: f64 = bids.iter().map(|level| level[1]).sum();
        let ask_vol: f64 = asks.iter().map(|level| level[1]).sum();
        let denom = bid_vol + ask_vol;
        let imbalance = if denom > 0.0 {
            (bid_vol - ask_vol) / denom
        } else {
            0.0
        };

        let spread = match (bids.first(), asks.first()) {
            (Some(best_bid), Some(best_ask)) => (best_ask[0] - best_bid[0]).max(0.0),
            _ => 0.0,
        };

        Self {
            symbol: symbol.into().to_uppercase(),
            bids,
            asks,
            imbalance,
            spread,
            ts,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Persistence conflicts surfaced to ingestion callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A tick already exists for this (symbol, ts). Callers treat this as a
    /// benign no-op, not a failure.
    #[error("duplicate price tick for {symbol} at {ts}")]
    DuplicateTick { symbol: String, ts: i64 },
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Thread-safe in-memory time-series tables with per-series retention caps.
pub struct TimeSeriesStore {
    max_rows: usize,
    symbols: RwLock<BTreeSet<String>>,
    ticks: RwLock<HashMap<String, BTreeMap<i64, PriceTick>>>,
    candles: RwLock<HashMap<CandleKey, BTreeMap<i64, Candle>>>,
    orderbooks: RwLock<HashMap<String, VecDeque<OrderBookSnapshot>>>,
}

impl TimeSeriesStore {
    /// Create a store retaining at most `max_rows_per_series` rows per
    /// (symbol[, timeframe]) series.
    pub fn new(max_rows_per_series: usize) -> Self {
        Self {
            max_rows: max_rows_per_series.max(1),
            symbols: RwLock::new(BTreeSet::new()),
            ticks: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            orderbooks: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Symbol registry
    // -------------------------------------------------------------------------

    /// Register an instrument on first observation. Instruments are never
    /// deleted, only referenced.
    pub fn ensure_symbol(&self, name: &str) -> String {
        let upper = name.to_uppercase();
        self.symbols.write().insert(upper.clone());
        upper
    }

    /// All known instruments, sorted.
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Idempotent bulk candle write keyed (symbol, timeframe, ts). Returns
    /// the number of rows written (inserts and overwrites both count).
    pub fn upsert_candles(&self, rows: Vec<Candle>) -> usize {
        if rows.is_empty() {
            return 0;
        }

        let mut affected = 0;
        let mut candles = self.candles.write();
        for mut row in rows {
            row.symbol = self.ensure_symbol(&row.symbol);
            let key = CandleKey {
                symbol: row.symbol.clone(),
                timeframe: row.timeframe.clone(),
            };
            let series = candles.entry(key).or_default();
            series.insert(row.ts, row);
            affected += 1;
            while series.len() > self.max_rows {
                series.pop_first();
            }
        }
        affected
    }

    /// Append one price tick. A tick already present for (symbol, ts) is
    /// rejected with [`StoreError::DuplicateTick`] rather than merged.
    pub fn insert_price_tick(&self, symbol: &str, price: f64, ts: i64) -> Result<PriceTick, StoreError> {
        let symbol = self.ensure_symbol(symbol);

        let mut ticks = self.ticks.write();
        let series = ticks.entry(symbol.clone()).or_default();
        if series.contains_key(&ts) {
            return Err(StoreError::DuplicateTick { symbol, ts });
        }

        let tick = PriceTick { symbol, price, ts };
        series.insert(ts, tick.clone());
        while series.len() > self.max_rows {
            series.pop_first();
        }
        Ok(tick)
    }

    /// Append one order-book snapshot.
    pub fn insert_orderbook_snapshot(&self, snapshot: OrderBookSnapshot) {
        let symbol = self.ensure_symbol(&snapshot.symbol);

        let mut books = self.orderbooks.write();
        let series = books.entry(symbol).or_default();
        series.push_back(snapshot);
        while series.len() > self.max_rows {
            series.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Reads (newest first)
    // -------------------------------------------------------------------------

    /// The most recent `limit` candles for (symbol, timeframe), newest first.
    pub fn latest_candles(&self, symbol: &str, timeframe: &str, limit: usize) -> Vec<Candle> {
        let key = CandleKey {
            symbol: symbol.to_uppercase(),
            timeframe: timeframe.to_string(),
        };
        let candles = self.candles.read();
        match candles.get(&key) {
            Some(series) => series.values().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// The most recent `limit` order-book snapshots for `symbol`, newest first.
    pub fn latest_orderbooks(&self, symbol: &str, limit: usize) -> Vec<OrderBookSnapshot> {
        let books = self.orderbooks.read();
        match books.get(&symbol.to_uppercase()) {
            Some(series) => series.iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// The most recent `limit` price ticks for `symbol`, newest first.
    pub fn recent_ticks(&self, symbol: &str, limit: usize) -> Vec<PriceTick> {
        let ticks = self.ticks.read();
        match ticks.get(&symbol.to_uppercase()) {
            Some(series) => series.values().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// The latest observed price per instrument, sorted by symbol.
    pub fn latest_prices(&self) -> Vec<PriceTick> {
        let ticks = self.ticks.read();
        let mut out: Vec<PriceTick> = ticks
            .values()
            .filter_map(|series| series.values().next_back().cloned())
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    // -------------------------------------------------------------------------
    // Session reset
    // -------------------------------------------------------------------------

    /// Drop all tick history. Instruments, candles, and order-book snapshots
    /// are retained.
    pub fn clear_ticks(&self) {
        self.ticks.write().clear();
    }
}

impl std::fmt::Debug for TimeSeriesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesStore")
            .field("symbols", &self.symbols.read().len())
            .field("candle_series", &self.candles.read().len())
            .field("tick_series", &self.ticks.read().len())
            .field("orderbook_series", &self.orderbooks.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(symbol: &str, tf: &str, ts: i64, close: f64) -> Candle {
        Candle {
            symbol: symbol.into(),
            timeframe: tf.into(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            ts,
        }
    }

    #[test]
    fn upsert_same_key_overwrites_single_row() {
        let store = TimeSeriesStore::new(100);

        let n = store.upsert_candles(vec![candle("btcusdt", "1m", 60_000, 100.0)]);
        assert_eq!(n, 1);
        let n = store.upsert_candles(vec![candle("BTCUSDT", "1m", 60_000, 200.0)]);
        assert_eq!(n, 1);

        let rows = store.latest_candles("BTCUSDT", "1m", 10);
        assert_eq!(rows.len(), 1);
        assert!((rows[0].close - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn candle_reads_are_newest_first() {
        let store = TimeSeriesStore::new(100);
        store.upsert_candles(vec![
            candle("ETHUSDT", "5m", 0, 1.0),
            candle("ETHUSDT", "5m", 300_000, 2.0),
            candle("ETHUSDT", "5m", 600_000, 3.0),
        ]);

        let rows = store.latest_candles("ETHUSDT", "5m", 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, 600_000);
        assert_eq!(rows[1].ts, 300_000);
    }

    #[test]
    fn candle_series_trim_to_cap() {
        let store = TimeSeriesStore::new(3);
        for i in 0..5 {
            store.upsert_candles(vec![candle("BTCUSDT", "1m", i * 60_000, i as f64)]);
        }
        let rows = store.latest_candles("BTCUSDT", "1m", 10);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.last().map(|c| c.ts), Some(120_000));
    }

    #[test]
    fn duplicate_tick_is_rejected_not_merged() {
        let store = TimeSeriesStore::new(100);
        store.insert_price_tick("btcusdt", 100.0, 1_000).unwrap();

        let err = store.insert_price_tick("BTCUSDT", 101.0, 1_000).unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicateTick {
                symbol: "BTCUSDT".into(),
                ts: 1_000
            }
        );

        // First write wins; only one row exists.
        let ticks = store.recent_ticks("BTCUSDT", 10);
        assert_eq!(ticks.len(), 1);
        assert!((ticks[0].price - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn latest_prices_returns_last_tick_per_symbol() {
        let store = TimeSeriesStore::new(100);
        store.insert_price_tick("BTCUSDT", 100.0, 1_000).unwrap();
        store.insert_price_tick("BTCUSDT", 105.0, 2_000).unwrap();
        store.insert_price_tick("ETHUSDT", 10.0, 1_500).unwrap();

        let latest = store.latest_prices();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].symbol, "BTCUSDT");
        assert!((latest[0].price - 105.0).abs() < f64::EPSILON);
        assert_eq!(latest[1].symbol, "ETHUSDT");
    }

    #[test]
    fn clear_ticks_retains_symbols_and_candles() {
        let store = TimeSeriesStore::new(100);
        store.insert_price_tick("BTCUSDT", 100.0, 1_000).unwrap();
        store.upsert_candles(vec![candle("BTCUSDT", "1m", 0, 1.0)]);

        store.clear_ticks();

        assert!(store.recent_ticks("BTCUSDT", 10).is_empty());
        assert!(store.latest_prices().is_empty());
        assert_eq!(store.symbols(), vec!["BTCUSDT".to_string()]);
        assert_eq!(store.latest_candles("BTCUSDT", "1m", 10).len(), 1);

        // A fresh tick at a previously used ts is accepted again.
        store.insert_price_tick("BTCUSDT", 99.0, 1_000).unwrap();
    }

    #[test]
    fn snapshot_imbalance_and_spread() {
        let ob = OrderBookSnapshot::from_levels(
            "btcusdt",
            vec![[100.0, 3.0], [99.0, 1.0]],
            vec![[101.0, 1.0]],
            1_000,
        );
        assert_eq!(ob.symbol, "BTCUSDT");
        // (4 - 1) / (4 + 1)
        assert!((ob.imbalance - 0.6).abs() < 1e-12);
        assert!((ob.spread - 1.0).abs() < 1e-12);
    }

    #[test]
    fn snapshot_edge_cases_empty_sides() {
        let empty = OrderBookSnapshot::from_levels("X", vec![], vec![], 0);
        assert_eq!(empty.imbalance, 0.0);
        assert_eq!(empty.spread, 0.0);

        let one_sided =
            OrderBookSnapshot::from_levels("X", vec![[100.0, 1.0]], vec![], 0);
        assert!((one_sided.imbalance - 1.0).abs() < 1e-12);
        assert_eq!(one_sided.spread, 0.0);

        // Crossed book: spread floors at zero.
        let crossed = OrderBookSnapshot::from_levels(
            "X",
            vec![[102.0, 1.0]],
            vec![[101.0, 1.0]],
            0,
        );
        assert_eq!(crossed.spread, 0.0);
    }

    #[test]
    fn orderbook_reads_are_newest_first_and_trimmed() {
        let store = TimeSeriesStore::new(2);
        for ts in [1_000, 2_000, 3_000] {
            store.insert_orderbook_snapshot(OrderBookSnapshot::from_levels(
                "BTCUSDT",
                vec![[100.0, 1.0]],
                vec![[101.0, 1.0]],
                ts,
            ));
        }
        let rows = store.latest_orderbooks("BTCUSDT", 10);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, 3_000);
        assert_eq!(rows[1].ts, 2_000);
    }
}
