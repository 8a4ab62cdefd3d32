// =============================================================================
// Market Monitor Caches — tradable universe + 24h leader/laggard statistics
// =============================================================================
//
// Two TTL-bound caches that keep read paths responsive when the venue is
// degraded. State machine per cache: EMPTY -> FRESH -> STALE -> FRESH -> ...
//
// A read past the TTL triggers at most one synchronous refresh attempt. On
// refresh failure a previous payload is served with stale=true; with no
// previous payload the cache synthesizes its fallback (configured symbols
// for the universe, an empty statistics set for the 24h snapshot).
//
// Refreshes compute the full new snapshot first and assign it under a single
// write lock, so concurrent readers never observe a partial payload.
// Concurrent expired readers may duplicate upstream work; the final cached
// value always reflects one completed refresh.
// =============================================================================

use std::cmp::Ordering;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::venue::{MarketSource, TickerStats};

/// Gainer/loser list length in every statistics snapshot.
const TOP_MOVERS: usize = 10;

// ---------------------------------------------------------------------------
// UniverseCache
// ---------------------------------------------------------------------------

struct UniverseState {
    symbols: Vec<String>,
    /// Epoch ms of the last successful refresh; 0 = never refreshed.
    updated_at: i64,
}

/// TTL-bound cache of the tradable instrument set.
pub struct UniverseCache {
    ttl_ms: i64,
    fallback: Vec<String>,
    inner: RwLock<UniverseState>,
}

impl UniverseCache {
    /// `fallback` is served when the first refresh ever fails (cold start
    /// against an unreachable venue).
    pub fn new(ttl_secs: u64, fallback: Vec<String>) -> Self {
        Self {
            ttl_ms: (ttl_secs as i64) * 1000,
            fallback,
            inner: RwLock::new(UniverseState {
                symbols: Vec::new(),
                updated_at: 0,
            }),
        }
    }

    /// Return the tradable universe, refreshing through `source` when the
    /// cached set is missing or past its TTL.
    pub async fn get(&self, source: &dyn MarketSource) -> Vec<String> {
        let now = Utc::now().timestamp_millis();
        let needs_refresh = {
            let state = self.inner.read();
            state.symbols.is_empty() || now - state.updated_at > self.ttl_ms
        };

        if needs_refresh {
            let fetched = source.fetch_universe().await;
            let mut state = self.inner.write();
            if !fetched.is_empty() {
                debug!(count = fetched.len(), "universe cache refreshed");
                state.symbols = fetched;
                state.updated_at = now;
            } else if !state.symbols.is_empty() {
                // Refresh failed; keep serving the previous set.
                warn!("universe refresh failed — serving previous symbol set");
            } else {
                warn!(
                    fallback = self.fallback.len(),
                    "universe refresh failed with no prior payload — using configured fallback"
                );
                state.symbols = self.fallback.clone();
                state.updated_at = now;
            }
        }

        self.inner.read().symbols.clone()
    }

    /// Epoch ms of the last accepted payload (0 if never populated).
    pub fn cached_at(&self) -> i64 {
        self.inner.read().updated_at
    }
}

impl std::fmt::Debug for UniverseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read();
        f.debug_struct("UniverseCache")
            .field("symbols", &state.symbols.len())
            .field("updated_at", &state.updated_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StatsCache
// ---------------------------------------------------------------------------

/// Filter parameters echoed with every statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsFilters {
    pub topn: usize,
    pub price_floor: f64,
    pub universe_cached_at: i64,
}

/// The cached 24-hour leader/laggard view.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Epoch ms of the last successful refresh; 0 = never refreshed.
    pub updated_at: i64,
    pub stale: bool,
    pub gainers: Vec<TickerStats>,
    pub losers: Vec<TickerStats>,
    pub universe_size: usize,
    pub filters: StatsFilters,
}

impl StatsSnapshot {
    fn empty() -> Self {
        Self {
            updated_at: 0,
            stale: true,
            gainers: Vec::new(),
            losers: Vec::new(),
            universe_size: 0,
            filters: StatsFilters::default(),
        }
    }
}

/// TTL-bound cache of 24h statistics: price-floor filter, volume-ranked
/// liquid set, top movers either way.
pub struct StatsCache {
    ttl_ms: i64,
    top_n: usize,
    price_floor: f64,
    inner: RwLock<StatsSnapshot>,
}

impl StatsCache {
    pub fn new(ttl_secs: u64, top_n: usize, price_floor: f64) -> Self {
        Self {
            ttl_ms: (ttl_secs as i64) * 1000,
            top_n,
            price_floor,
            inner: RwLock::new(StatsSnapshot::empty()),
        }
    }

    /// Return the 24h leader/laggard snapshot, refreshing when expired.
    pub async fn get(
        &self,
        source: &dyn MarketSource,
        universe: &UniverseCache,
    ) -> StatsSnapshot {
        let now = Utc::now().timestamp_millis();
        let expired = {
            let snap = self.inner.read();
            now - snap.updated_at > self.ttl_ms
        };

        if expired {
            self.refresh(source, universe, now).await;
        }

        self.inner.read().clone()
    }

    /// One refresh attempt. Failure leaves the previous payload in place and
    /// only flips the stale flag.
    async fn refresh(&self, source: &dyn MarketSource, universe: &UniverseCache, now: i64) {
        let symbols = universe.get(source).await;
        let stats = source.fetch_24h_stats(&symbols).await;

        if stats.is_empty() && !symbols.is_empty() {
            // Upstream gave us nothing for a non-empty universe: a failed
            // refresh, not a legitimately empty market.
            let mut snap = self.inner.write();
            snap.stale = true;
            warn!(
                universe = symbols.len(),
                "24h stats refresh failed — serving previous snapshot as stale"
            );
            return;
        }

        let mut rows: Vec<TickerStats> = stats
            .into_iter()
            .filter(|r| r.last_price >= self.price_floor)
            .collect();

        // Liquid set: top-N by 24h quote volume.
        rows.sort_by(|a, b| {
            b.quote_volume
                .partial_cmp(&a.quote_volume)
                .unwrap_or(Ordering::Equal)
        });
        rows.truncate(self.top_n);

        let mut gainers = rows.clone();
        gainers.sort_by(|a, b| {
            b.price_change_percent
                .partial_cmp(&a.price_change_percent)
                .unwrap_or(Ordering::Equal)
        });
        gainers.truncate(TOP_MOVERS);

        let mut losers = rows;
        losers.sort_by(|a, b| {
            a.price_change_percent
                .partial_cmp(&b.price_change_percent)
                .unwrap_or(Ordering::Equal)
        });
        losers.truncate(TOP_MOVERS);

        let snapshot = StatsSnapshot {
            updated_at: now,
            stale: false,
            gainers,
            losers,
            universe_size: symbols.len(),
            filters: StatsFilters {
                topn: self.top_n,
                price_floor: self.price_floor,
                universe_cached_at: universe.cached_at(),
            },
        };

        debug!(
            universe = snapshot.universe_size,
            gainers = snapshot.gainers.len(),
            losers = snapshot.losers.len(),
            "24h stats cache refreshed"
        );

        // Assigned as one unit: readers see the old snapshot or the new one,
        // never a mixture.
        *self.inner.write() = snapshot;
    }
}

impl std::fmt::Debug for StatsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.inner.read();
        f.debug_struct("StatsCache")
            .field("updated_at", &snap.updated_at)
            .field("stale", &snap.stale)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted market source: each call pops the next response; once the
    /// script runs dry every call fails (empty result).
    struct ScriptedSource {
        universes: Mutex<VecDeque<Vec<String>>>,
        stats: Mutex<VecDeque<Vec<TickerStats>>>,
    }

    impl ScriptedSource {
        fn new(
            universes: Vec<Vec<String>>,
            stats: Vec<Vec<TickerStats>>,
        ) -> Self {
            Self {
                universes: Mutex::new(universes.into()),
                stats: Mutex::new(stats.into()),
            }
        }
    }

    #[async_trait]
    impl MarketSource for ScriptedSource {
        async fn fetch_universe(&self) -> Vec<String> {
            self.universes.lock().pop_front().unwrap_or_default()
        }

        async fn fetch_24h_stats(&self, _symbols: &[String]) -> Vec<TickerStats> {
            self.stats.lock().pop_front().unwrap_or_default()
        }
    }

    fn stats_row(symbol: &str, last: f64, pct: f64, volume: f64) -> TickerStats {
        TickerStats {
            symbol: symbol.into(),
            last_price: last,
            high_price: last * 1.1,
            low_price: last * 0.9,
            price_change_percent: pct,
            quote_volume: volume,
        }
    }

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn universe_serves_fetched_set_and_keeps_previous_on_failure() {
        let source = ScriptedSource::new(
            vec![syms(&["BTCUSDT", "ETHUSDT"])], // later calls fail
            vec![],
        );
        let cache = UniverseCache::new(0, syms(&["FALLBACK"]));

        let first = cache.get(&source).await;
        assert_eq!(first, syms(&["BTCUSDT", "ETHUSDT"]));

        // TTL 0 forces a refresh; the scripted source now fails, so the
        // previous set must survive.
        let second = cache.get(&source).await;
        assert_eq!(second, syms(&["BTCUSDT", "ETHUSDT"]));
    }

    #[tokio::test]
    async fn universe_falls_back_on_cold_start_failure() {
        let source = ScriptedSource::new(vec![], vec![]);
        let cache = UniverseCache::new(600, syms(&["BTCUSDT", "ETHUSDT"]));

        let got = cache.get(&source).await;
        assert_eq!(got, syms(&["BTCUSDT", "ETHUSDT"]));
    }

    #[tokio::test]
    async fn stats_refresh_ranks_filters_and_cuts() {
        // 12 instruments; one below the price floor, one squeezed out of the
        // liquid set by volume.
        let mut rows = Vec::new();
        for i in 0..10 {
            rows.push(stats_row(
                &format!("SYM{i}USDT"),
                1.0,
                i as f64 - 5.0,
                1_000.0 + i as f64,
            ));
        }
        rows.push(stats_row("DUSTUSDT", 0.000_01, 99.0, 9_999.0));
        rows.push(stats_row("THINUSDT", 1.0, 50.0, 1.0));

        let universe: Vec<String> = rows.iter().map(|r| r.symbol.clone()).collect();
        let source = ScriptedSource::new(vec![universe.clone()], vec![rows]);
        let cache = StatsCache::new(60, 10, 0.0001);
        let ucache = UniverseCache::new(600, Vec::new());

        let snap = cache.get(&source, &ucache).await;
        assert!(!snap.stale);
        assert_eq!(snap.universe_size, 12);
        assert_eq!(snap.filters.topn, 10);

        // DUSTUSDT dropped by the price floor, THINUSDT by the volume cut.
        let names: Vec<&str> = snap.gainers.iter().map(|r| r.symbol.as_str()).collect();
        assert!(!names.contains(&"DUSTUSDT"));
        assert!(!names.contains(&"THINUSDT"));

        // Gainers descend, losers ascend by percent change.
        assert_eq!(snap.gainers[0].symbol, "SYM9USDT");
        assert_eq!(snap.losers[0].symbol, "SYM0USDT");
        assert!(snap.gainers.len() <= 10 && snap.losers.len() <= 10);
    }

    #[tokio::test]
    async fn stats_failed_refresh_serves_previous_payload_as_stale() {
        let universe = syms(&["BTCUSDT"]);
        let source = ScriptedSource::new(
            vec![universe.clone(), universe.clone()],
            vec![vec![stats_row("BTCUSDT", 100.0, 1.5, 10.0)]], // second fetch fails
        );
        let cache = StatsCache::new(0, 10, 0.0001);
        let ucache = UniverseCache::new(600, Vec::new());

        let fresh = cache.get(&source, &ucache).await;
        assert!(!fresh.stale);
        assert_eq!(fresh.gainers.len(), 1);
        let first_updated_at = fresh.updated_at;

        // Let the zero TTL lapse so the next read attempts a refresh.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let stale = cache.get(&source, &ucache).await;
        assert!(stale.stale);
        // Previous payload, untouched timestamp.
        assert_eq!(stale.updated_at, first_updated_at);
        assert_eq!(stale.gainers.len(), 1);
        assert_eq!(stale.gainers[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn stats_cold_start_failure_yields_empty_stale_snapshot() {
        let source = ScriptedSource::new(vec![syms(&["BTCUSDT"])], vec![]);
        let cache = StatsCache::new(60, 10, 0.0001);
        let ucache = UniverseCache::new(600, Vec::new());

        let snap = cache.get(&source, &ucache).await;
        assert!(snap.stale);
        assert!(snap.gainers.is_empty());
        assert!(snap.losers.is_empty());
        assert_eq!(snap.updated_at, 0);
    }
}
