// =============================================================================
// Vigil Market Engine — Main Entry Point
// =============================================================================
//
// Boot order: config, shared state, background ingestion (candle polling,
// order-book polling + streaming, price ticks), then the REST surface.
// Ingestion keeps retrying indefinitely; the only way out is Ctrl+C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod exchange;
mod ingest;
mod ledger;
mod monitor;
mod store;
mod trending;
mod venue;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Vigil Market Engine starting up");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        timeframes = ?config.timeframes,
        venue = %config.venue_base_url,
        "Configured market watch"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config));

    // ── 3. Spawn ingestion loops ─────────────────────────────────────────
    {
        let s = state.clone();
        tokio::spawn(async move { ingest::run_candle_loop(s).await });
    }
    {
        let s = state.clone();
        tokio::spawn(async move { ingest::run_orderbook_loop(s).await });
    }
    {
        let s = state.clone();
        tokio::spawn(async move { ingest::run_price_loop(s).await });
    }

    let symbols = state.runtime_config.read().symbols.clone();
    for symbol in &symbols {
        let s = state.clone();
        let sym = symbol.clone();
        tokio::spawn(async move { ingest::run_depth_stream_task(s, sym).await });
    }

    info!(count = symbols.len(), "Ingestion loops launched");

    // ── 4. Start the API server ──────────────────────────────────────────
    let bind_addr = state.runtime_config.read().bind_addr.clone();
    let api_state = state.clone();
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Vigil Market Engine shut down complete.");
    Ok(())
}
