// =============================================================================
// Trending Detector — session-scoped momentum leader/laggard tracking
// =============================================================================
//
// Tracks running session highs/lows per instrument and derives two signals
// on each refresh pass:
//   - laggard: price fell at least loss_threshold_pct from the session high
//   - leader:  price set a new session high (gain measured from the first
//     observed price) or recovered at least recovery_pct from the last local
//     low (gain measured from that low)
// The two signals are independent; an instrument can emit both in one pass.
//
// State is session-scoped: it survives cache TTL expiry and is cleared only
// by an explicit reset (used together with a tick-history wipe so stale
// baselines never outlive the data they came from).
// =============================================================================

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::store::PriceTick;

/// Leader/laggard list length in every trending snapshot.
const TOP_MOVERS: usize = 10;

/// Guard against a zero baseline when computing percentage gains.
const MIN_BASE: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Per-instrument state
// ---------------------------------------------------------------------------

/// Session baselines for one instrument. Created on the first observed
/// price after a reset; mutated on every subsequent observation.
#[derive(Debug, Clone, PartialEq)]
struct TrendingState {
    first: f64,
    high: f64,
    low: f64,
    last_local_low: f64,
}

impl TrendingState {
    fn seed(price: f64) -> Self {
        Self {
            first: price,
            high: price,
            low: price,
            last_local_low: price,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One leader or laggard row.
#[derive(Debug, Clone, Serialize)]
pub struct TrendingEntry {
    pub symbol: String,
    #[serde(rename = "lastPrice")]
    pub last_price: f64,
    #[serde(rename = "highPrice")]
    pub high_price: f64,
    #[serde(rename = "lowPrice")]
    pub low_price: f64,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: f64,
}

/// Threshold metadata echoed with every snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TrendingMeta {
    pub loss_pct: f64,
    pub recovery_pct: f64,
    pub label: &'static str,
}

/// The cached session leader/laggard view.
#[derive(Debug, Clone, Serialize)]
pub struct TrendingSnapshot {
    /// Epoch ms of the last refresh; 0 = never refreshed.
    pub updated_at: i64,
    pub stale: bool,
    pub gainers: Vec<TrendingEntry>,
    pub losers: Vec<TrendingEntry>,
    pub universe_size: usize,
    pub meta: TrendingMeta,
}

impl TrendingSnapshot {
    fn empty(loss_pct: f64, recovery_pct: f64) -> Self {
        Self {
            updated_at: 0,
            stale: true,
            gainers: Vec::new(),
            losers: Vec::new(),
            universe_size: 0,
            meta: TrendingMeta {
                loss_pct,
                recovery_pct,
                label: "Session-based",
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Injectable session-momentum tracker: per-instrument state table plus a
/// TTL-bound output snapshot. Thresholds are fixed at construction.
pub struct TrendingDetector {
    ttl_ms: i64,
    loss_threshold_pct: f64,
    recovery_pct: f64,
    states: RwLock<HashMap<String, TrendingState>>,
    cache: RwLock<TrendingSnapshot>,
}

impl TrendingDetector {
    pub fn new(ttl_secs: u64, loss_threshold_pct: f64, recovery_pct: f64) -> Self {
        Self {
            ttl_ms: (ttl_secs as i64) * 1000,
            loss_threshold_pct,
            recovery_pct,
            states: RwLock::new(HashMap::new()),
            cache: RwLock::new(TrendingSnapshot::empty(loss_threshold_pct, recovery_pct)),
        }
    }

    /// Return the trending snapshot, recomputing from `prices` only when the
    /// cached output is past its TTL.
    pub fn get(&self, prices: &[PriceTick]) -> TrendingSnapshot {
        let now = Utc::now().timestamp_millis();
        let expired = {
            let snap = self.cache.read();
            now - snap.updated_at > self.ttl_ms
        };
        if expired {
            self.refresh(prices);
        }
        self.cache.read().clone()
    }

    /// Current cached output without triggering a refresh.
    pub fn snapshot(&self) -> TrendingSnapshot {
        self.cache.read().clone()
    }

    /// Recompute leaders/laggards over the latest price per instrument,
    /// updating session baselines along the way.
    pub fn refresh(&self, prices: &[PriceTick]) {
        let mut gainers: Vec<TrendingEntry> = Vec::new();
        let mut losers: Vec<TrendingEntry> = Vec::new();

        {
            let mut states = self.states.write();
            for tick in prices {
                let st = states
                    .entry(tick.symbol.clone())
                    .or_insert_with(|| TrendingState::seed(tick.price));
                let price = tick.price;

                if price > st.high {
                    st.high = price;
                }
                if price < st.low {
                    st.low = price;
                    st.last_local_low = price;
                }

                // Laggard: fell at least loss_threshold_pct from the session high.
                if st.high > 0.0
                    && price <= st.high * (1.0 - self.loss_threshold_pct / 100.0)
                {
                    let drop_pct = (st.high - price) / st.high * 100.0;
                    losers.push(TrendingEntry {
                        symbol: tick.symbol.clone(),
                        last_price: price,
                        high_price: st.high,
                        low_price: st.low,
                        price_change_percent: -round4(drop_pct),
                    });
                }

                // Leader: new session high, or recovered from the last local
                // low. Both comparisons are inclusive.
                let mut gain_pct = 0.0;
                let mut gained = false;
                if price >= st.high {
                    let base = st.first.max(MIN_BASE);
                    gain_pct = (price / base - 1.0) * 100.0;
                    gained = true;
                } else if price >= st.last_local_low * (1.0 + self.recovery_pct / 100.0) {
                    let base = st.last_local_low.max(MIN_BASE);
                    gain_pct = (price / base - 1.0) * 100.0;
                    gained = true;
                }
                if gained && gain_pct > 0.0 {
                    gainers.push(TrendingEntry {
                        symbol: tick.symbol.clone(),
                        last_price: price,
                        high_price: st.high,
                        low_price: st.low,
                        price_change_percent: round4(gain_pct),
                    });
                }
            }
        }

        gainers.sort_by(|a, b| {
            b.price_change_percent
                .partial_cmp(&a.price_change_percent)
                .unwrap_or(Ordering::Equal)
        });
        gainers.truncate(TOP_MOVERS);

        losers.sort_by(|a, b| {
            a.price_change_percent
                .partial_cmp(&b.price_change_percent)
                .unwrap_or(Ordering::Equal)
        });
        losers.truncate(TOP_MOVERS);

        let snapshot = TrendingSnapshot {
            updated_at: Utc::now().timestamp_millis(),
            stale: false,
            gainers,
            losers,
            universe_size: prices.len(),
            meta: TrendingMeta {
                loss_pct: self.loss_threshold_pct,
                recovery_pct: self.recovery_pct,
                label: "Session-based",
            },
        };

        debug!(
            tracked = snapshot.universe_size,
            gainers = snapshot.gainers.len(),
            losers = snapshot.losers.len(),
            "trending snapshot refreshed"
        );

        *self.cache.write() = snapshot;
    }

    /// Clear all per-instrument state and the cached output unconditionally.
    /// The next observed price re-baselines each instrument.
    pub fn reset(&self) {
        self.states.write().clear();
        *self.cache.write() =
            TrendingSnapshot::empty(self.loss_threshold_pct, self.recovery_pct);
        info!("trending state reset");
    }

    /// Number of instruments currently tracked.
    pub fn tracked(&self) -> usize {
        self.states.read().len()
    }
}

impl std::fmt::Debug for TrendingDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrendingDetector")
            .field("tracked", &self.states.read().len())
            .field("loss_threshold_pct", &self.loss_threshold_pct)
            .field("recovery_pct", &self.recovery_pct)
            .finish()
    }
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
