// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable lives here: venue endpoints, tracked symbols, cache TTLs,
// detector thresholds, and ingestion cadences. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_venue_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_venue_ws_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_timeframes() -> Vec<String> {
    ["1m", "5m", "15m", "1h", "1d"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_universe_ttl_secs() -> u64 {
    1800
}

fn default_stats_ttl_secs() -> u64 {
    20
}

fn default_trending_ttl_secs() -> u64 {
    10
}

fn default_top_n() -> usize {
    200
}

fn default_price_floor() -> f64 {
    0.0001
}

fn default_loss_threshold_pct() -> f64 {
    2.0
}

fn default_recovery_pct() -> f64 {
    0.5
}

fn default_candle_poll_secs() -> u64 {
    60
}

fn default_orderbook_poll_secs() -> u64 {
    2
}

fn default_price_poll_secs() -> u64 {
    2
}

fn default_candle_lookback() -> u32 {
    200
}

fn default_depth_levels() -> u32 {
    20
}

fn default_max_rows_per_series() -> usize {
    5000
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Venue connectivity --------------------------------------------------
    #[serde(default = "default_venue_base_url")]
    pub venue_base_url: String,

    #[serde(default = "default_venue_ws_url")]
    pub venue_ws_url: String,

    /// Per-request HTTP timeout.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    // --- Instruments ---------------------------------------------------------
    /// Symbols the engine ingests and tracks. Also the universe fallback
    /// when the venue is unreachable on cold start.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle timeframes polled for every tracked symbol.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,

    // --- Cache TTLs ----------------------------------------------------------
    #[serde(default = "default_universe_ttl_secs")]
    pub universe_ttl_secs: u64,

    #[serde(default = "default_stats_ttl_secs")]
    pub stats_ttl_secs: u64,

    #[serde(default = "default_trending_ttl_secs")]
    pub trending_ttl_secs: u64,

    // --- 24h statistics filters ---------------------------------------------
    /// Liquid-set size: top-N instruments by 24h quote volume.
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Instruments whose last price is below this floor are dropped.
    #[serde(default = "default_price_floor")]
    pub price_floor: f64,

    // --- Trending detector thresholds ---------------------------------------
    /// Percent drop from the session high that marks a laggard.
    #[serde(default = "default_loss_threshold_pct")]
    pub loss_threshold_pct: f64,

    /// Percent recovery from the last local low that marks a leader.
    #[serde(default = "default_recovery_pct")]
    pub recovery_pct: f64,

    // --- Ingestion cadences --------------------------------------------------
    #[serde(default = "default_candle_poll_secs")]
    pub candle_poll_secs: u64,

    #[serde(default = "default_orderbook_poll_secs")]
    pub orderbook_poll_secs: u64,

    #[serde(default = "default_price_poll_secs")]
    pub price_poll_secs: u64,

    /// Historical klines fetched per candle poll.
    #[serde(default = "default_candle_lookback")]
    pub candle_lookback: u32,

    /// Order-book depth levels per snapshot and stream subscription.
    #[serde(default = "default_depth_levels")]
    pub depth_levels: u32,

    // --- Storage -------------------------------------------------------------
    /// Retention cap per stored series.
    #[serde(default = "default_max_rows_per_series")]
    pub max_rows_per_series: usize,

    // --- HTTP surface --------------------------------------------------------
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            venue_base_url: default_venue_base_url(),
            venue_ws_url: default_venue_ws_url(),
            http_timeout_secs: default_http_timeout_secs(),
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            universe_ttl_secs: default_universe_ttl_secs(),
            stats_ttl_secs: default_stats_ttl_secs(),
            trending_ttl_secs: default_trending_ttl_secs(),
            top_n: default_top_n(),
            price_floor: default_price_floor(),
            loss_threshold_pct: default_loss_threshold_pct(),
            recovery_pct: default_recovery_pct(),
            candle_poll_secs: default_candle_poll_secs(),
            orderbook_poll_secs: default_orderbook_poll_secs(),
            price_poll_secs: default_price_poll_secs(),
            candle_lookback: default_candle_lookback(),
            depth_levels: default_depth_levels(),
            max_rows_per_series: default_max_rows_per_series(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides: `VIGIL_SYMBOLS` (comma-separated) and
    /// `VIGIL_BIND_ADDR`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("VIGIL_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(addr) = std::env::var("VIGIL_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.venue_base_url, "https://api.binance.com");
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.timeframes.len(), 5);
        assert_eq!(cfg.universe_ttl_secs, 1800);
        assert_eq!(cfg.stats_ttl_secs, 20);
        assert_eq!(cfg.trending_ttl_secs, 10);
        assert_eq!(cfg.top_n, 200);
        assert!((cfg.price_floor - 0.0001).abs() < f64::EPSILON);
        assert!((cfg.loss_threshold_pct - 2.0).abs() < f64::EPSILON);
        assert!((cfg.recovery_pct - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.candle_poll_secs, 60);
        assert_eq!(cfg.orderbook_poll_secs, 2);
        assert_eq!(cfg.candle_lookback, 200);
        assert_eq!(cfg.depth_levels, 20);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.stats_ttl_secs, 20);
        assert_eq!(cfg.max_rows_per_series, 5000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["SOLUSDT"], "trending_ttl_secs": 5 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["SOLUSDT"]);
        assert_eq!(cfg.trending_ttl_secs, 5);
        assert_eq!(cfg.universe_ttl_secs, 1800);
        assert_eq!(cfg.top_n, 200);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.stats_ttl_secs, cfg2.stats_ttl_secs);
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
    }
}
