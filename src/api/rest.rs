// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Thin presentation wiring over the core: every handler is a direct call
// into the store, a cache, the detector, or the ledger. CORS is configured
// permissively for development; tighten `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::exchange::ExchangeAdapter;
use crate::ledger::Side;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Status ──────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/config", get(get_config))
        // ── Monitor ─────────────────────────────────────────────────
        .route("/monitor/symbols", get(monitor_symbols))
        .route("/monitor/universe", get(universe))
        .route("/monitor/prices/latest", get(latest_prices))
        .route("/monitor/top24h", get(top24h))
        .route("/monitor/trending", get(trending))
        .route("/monitor/trending/reset", post(reset_trending))
        // ── Market data ─────────────────────────────────────────────
        .route("/market/candles/latest", get(latest_candles))
        .route("/market/orderbook/latest", get(latest_orderbooks))
        // ── Trading ─────────────────────────────────────────────────
        .route("/trading/status", get(trading_status))
        .route("/trading/start", post(trading_start))
        .route("/trading/stop", post(trading_stop))
        .route("/trading/orders", get(orders))
        .route("/trading/positions", get(positions))
        .route("/trading/balance", get(balance))
        .route("/trading/execute", post(execute_order))
        .route("/trading/reset", post(reset_price_history))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Status
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "recent_errors": state.recent_errors.read().len(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = state.runtime_config.read();
    Json(serde_json::json!({
        "symbols": cfg.symbols,
        "timeframes": cfg.timeframes,
        "venue_base_url": cfg.venue_base_url,
        "paper_trading": true,
    }))
}

// =============================================================================
// Monitor
// =============================================================================

async fn monitor_symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.symbols())
}

/// Tradable instrument universe (cached, TTL-bound, falls back to the
/// configured symbols when the venue is unreachable).
async fn universe(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.universe_cache.get(state.venue.as_ref()).await)
}

async fn latest_prices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.latest_prices())
}

/// Cached 24h gainers/losers with staleness flag and filter parameters.
async fn top24h(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.top24_snapshot().await)
}

/// Session-based gainers/losers from live tick history.
async fn trending(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.trending_snapshot())
}

async fn reset_trending(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.trending.reset();
    Json(serde_json::json!({ "ok": true }))
}

// =============================================================================
// Market data
// =============================================================================

#[derive(Deserialize)]
struct CandleQuery {
    symbol: String,
    timeframe: String,
    limit: Option<usize>,
}

async fn latest_candles(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CandleQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(200).clamp(1, 1000);
    Json(state.store.latest_candles(&q.symbol, &q.timeframe, limit))
}

#[derive(Deserialize)]
struct OrderbookQuery {
    symbol: String,
    limit: Option<usize>,
}

async fn latest_orderbooks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<OrderbookQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    Json(state.store.latest_orderbooks(&q.symbol, limit))
}

// =============================================================================
// Trading
// =============================================================================

async fn trading_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "enabled": *state.trading_enabled.read() }))
}

async fn trading_start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.trading_enabled.write() = true;
    info!("trading enabled");
    Json(serde_json::json!({ "enabled": true }))
}

async fn trading_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.trading_enabled.write() = false;
    info!("trading disabled");
    Json(serde_json::json!({ "enabled": false }))
}

async fn orders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ledger.list_orders(200))
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ledger.list_positions())
}

#[derive(Deserialize)]
struct BalanceQuery {
    asset: Option<String>,
}

/// Free balance on the simulated exchange.
async fn balance(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BalanceQuery>,
) -> impl IntoResponse {
    let asset = q.asset.unwrap_or_else(|| "USDT".to_string());
    let free = state
        .exchange
        .fetch_balance(&asset)
        .await
        .unwrap_or_default();
    Json(serde_json::json!({ "asset": asset, "free": free }))
}

#[derive(Deserialize)]
struct ExecuteOrderRequest {
    symbol: String,
    side: Side,
    qty: f64,
    price: f64,
}

/// Execute a simulated order. Invalid orders are rejected with 400, not
/// retried.
async fn execute_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteOrderRequest>,
) -> impl IntoResponse {
    match state
        .ledger
        .execute_order(&req.symbol, req.side, req.qty, req.price)
    {
        Ok(order) => (StatusCode::OK, Json(serde_json::json!(order))).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}

/// Clear tick history and session trending state; instruments and candle
/// history remain.
async fn reset_price_history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.reset_price_history();
    info!("price history and trending state reset");
    Json(serde_json::json!({ "ok": true }))
}
