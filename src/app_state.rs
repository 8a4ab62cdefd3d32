// =============================================================================
// Central Application State — Vigil Market Engine
// =============================================================================
//
// The single source of truth shared across all async tasks via Arc<AppState>.
// Subsystems manage their own interior mutability; AppState ties them
// together and hosts the small amount of cross-cutting state (error ring,
// trading flag, uptime).
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::exchange::PaperExchange;
use crate::ledger::Ledger;
use crate::monitor::{StatsCache, StatsSnapshot, UniverseCache};
use crate::store::TimeSeriesStore;
use crate::trending::{TrendingDetector, TrendingSnapshot};
use crate::venue::VenueClient;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central application state shared across all async tasks.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Venue & storage ────────────────────────────────────────────────
    pub venue: Arc<VenueClient>,
    pub store: Arc<TimeSeriesStore>,

    // ── Caches & detector ──────────────────────────────────────────────
    pub universe_cache: UniverseCache,
    pub stats_cache: StatsCache,
    pub trending: TrendingDetector,

    // ── Trading ────────────────────────────────────────────────────────
    pub ledger: Ledger,
    /// Simulated venue: marked to the latest observed tick per instrument.
    pub exchange: Arc<PaperExchange>,
    /// In-memory enable flag for the simulated trading surface.
    pub trading_enabled: RwLock<bool>,

    // ── Operational ────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the full engine state from `config`. All subsystems start
    /// empty; the caches fall back to the configured symbol set until the
    /// venue answers.
    pub fn new(config: RuntimeConfig) -> Self {
        let venue = Arc::new(VenueClient::new(
            config.venue_base_url.clone(),
            config.http_timeout_secs,
        ));
        let store = Arc::new(TimeSeriesStore::new(config.max_rows_per_series));
        for symbol in &config.symbols {
            store.ensure_symbol(symbol);
        }

        let universe_cache = UniverseCache::new(config.universe_ttl_secs, config.symbols.clone());
        let stats_cache = StatsCache::new(config.stats_ttl_secs, config.top_n, config.price_floor);
        let trending = TrendingDetector::new(
            config.trending_ttl_secs,
            config.loss_threshold_pct,
            config.recovery_pct,
        );

        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            venue,
            store,
            universe_cache,
            stats_cache,
            trending,
            ledger: Ledger::new(),
            exchange: Arc::new(PaperExchange::new()),
            trading_enabled: RwLock::new(false),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Error log ────────────────────────────────────────────────────────

    /// Record an error message. The ring is capped at [`MAX_RECENT_ERRORS`];
    /// oldest entries are evicted when the limit is reached.
    pub fn push_error(&self, msg: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    // ── Derived views ────────────────────────────────────────────────────

    /// Current 24h leader/laggard snapshot (refreshes through the venue
    /// when expired).
    pub async fn top24_snapshot(&self) -> StatsSnapshot {
        self.stats_cache
            .get(self.venue.as_ref(), &self.universe_cache)
            .await
    }

    /// Current session trending snapshot, fed from the store's latest
    /// observed prices.
    pub fn trending_snapshot(&self) -> TrendingSnapshot {
        self.trending.get(&self.store.latest_prices())
    }

    // ── Session resets ───────────────────────────────────────────────────

    /// Clear tick history and the trending session state together so stale
    /// baselines never outlive the data they were computed against.
    /// Instruments and candle history are retained.
    pub fn reset_price_history(&self) {
        self.store.clear_ticks();
        self.trending.reset();
    }

    /// Seconds since engine start.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_is_capped() {
        let state = AppState::new(RuntimeConfig::default());
        for i in 0..60 {
            state.push_error(format!("err {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "err 10");
        assert_eq!(errors.last().unwrap().message, "err 59");
    }

    #[test]
    fn configured_symbols_are_registered_at_startup() {
        let state = AppState::new(RuntimeConfig::default());
        assert_eq!(state.store.symbols(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn reset_price_history_clears_ticks_and_trending_together() {
        let state = AppState::new(RuntimeConfig::default());
        state.store.insert_price_tick("BTCUSDT", 100.0, 1_000).unwrap();
        state.trending.refresh(&state.store.latest_prices());
        assert_eq!(state.trending.tracked(), 1);

        state.reset_price_history();

        assert!(state.store.latest_prices().is_empty());
        assert_eq!(state.trending.tracked(), 0);
        assert_eq!(state.store.symbols(), vec!["BTCUSDT", "ETHUSDT"]);
    }
}
