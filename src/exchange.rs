// =============================================================================
// Exchange Adapter — polymorphic seam between the core and any venue
// =============================================================================
//
// The capability set is deliberately small: fetch a price, place or cancel a
// simulated order, query a balance. Two implementations:
//   - PaperExchange:  deterministic in-memory simulator, never touches the
//     network. Every order fills immediately.
//   - VenueExchange:  thin adapter over the REST client. Prices are live;
//     order routing and balances are unsupported (simulation only — real
//     order routing is out of scope).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::ledger::Side;
use crate::venue::VenueClient;

/// Seed quote balance for the paper exchange.
const PAPER_QUOTE_BALANCE: f64 = 100_000.0;
/// Price assumed for instruments the paper exchange has never seen.
const PAPER_DEFAULT_PRICE: f64 = 1.0;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Outcome of a placed (simulated) order.
#[derive(Debug, Clone, Serialize)]
pub struct FillReport {
    pub order_id: String,
    pub status: String,
    pub price: f64,
    pub qty: f64,
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("operation not supported by this adapter: {0}")]
    Unsupported(&'static str),
    #[error("no price available for {0}")]
    PriceUnavailable(String),
}

/// Venue-facing capability set consumed by trading callers.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Make an instrument known to the adapter (no-op where not needed).
    async fn ensure_instrument(&self, symbol: &str);

    /// Current price for an instrument.
    async fn fetch_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Place an order; `price` of `None` fills at the adapter's current
    /// price for the instrument.
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: Option<f64>,
    ) -> Result<FillReport, ExchangeError>;

    /// Cancel a previously placed order.
    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    /// Free balance for an asset.
    async fn fetch_balance(&self, asset: &str) -> Result<f64, ExchangeError>;
}

// ---------------------------------------------------------------------------
// Paper exchange
// ---------------------------------------------------------------------------

/// Deterministic in-memory simulator. Order ids are monotonic, fills are
/// immediate, and nothing leaves the process.
pub struct PaperExchange {
    balances: Mutex<HashMap<String, f64>>,
    prices: Mutex<HashMap<String, f64>>,
    last_id: AtomicU64,
}

impl PaperExchange {
    pub fn new() -> Self {
        let mut balances = HashMap::new();
        balances.insert("USDT".to_string(), PAPER_QUOTE_BALANCE);
        Self {
            balances: Mutex::new(balances),
            prices: Mutex::new(HashMap::new()),
            last_id: AtomicU64::new(0),
        }
    }

    /// Set the simulated price for an instrument (e.g. from live ticks).
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().insert(symbol.to_uppercase(), price);
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn ensure_instrument(&self, symbol: &str) {
        self.prices
            .lock()
            .entry(symbol.to_uppercase())
            .or_insert(PAPER_DEFAULT_PRICE);
    }

    async fn fetch_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        Ok(self
            .prices
            .lock()
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(PAPER_DEFAULT_PRICE))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: Option<f64>,
    ) -> Result<FillReport, ExchangeError> {
        let fill_price = match price {
            Some(p) => p,
            None => self.fetch_price(symbol).await?,
        };
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;

        debug!(symbol, %side, qty, fill_price, order_id = id, "paper exchange fill");

        Ok(FillReport {
            order_id: id.to_string(),
            status: "FILLED".to_string(),
            price: fill_price,
            qty,
            side,
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn fetch_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        Ok(self.balances.lock().get(asset).copied().unwrap_or(0.0))
    }
}

// ---------------------------------------------------------------------------
// Real-venue adapter
// ---------------------------------------------------------------------------

/// Adapter over the live venue. Prices come from REST; everything that would
/// require authenticated trading is unsupported.
pub struct VenueExchange {
    client: Arc<VenueClient>,
}

impl VenueExchange {
    pub fn new(client: Arc<VenueClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExchangeAdapter for VenueExchange {
    async fn ensure_instrument(&self, _symbol: &str) {}

    async fn fetch_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.client
            .fetch_ticker_price(symbol)
            .await
            .ok_or_else(|| ExchangeError::PriceUnavailable(symbol.to_uppercase()))
    }

    async fn place_order(
        &self,
        _symbol: &str,
        _side: Side,
        _qty: f64,
        _price: Option<f64>,
    ) -> Result<FillReport, ExchangeError> {
        Err(ExchangeError::Unsupported("place_order"))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), ExchangeError> {
        Err(ExchangeError::Unsupported("cancel_order"))
    }

    async fn fetch_balance(&self, _asset: &str) -> Result<f64, ExchangeError> {
        Err(ExchangeError::Unsupported("fetch_balance"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paper_order_ids_are_monotonic() {
        let ex = PaperExchange::new();
        let a = ex.place_order("BTCUSDT", Side::Buy, 1.0, Some(100.0)).await.unwrap();
        let b = ex.place_order("BTCUSDT", Side::Sell, 1.0, Some(101.0)).await.unwrap();
        assert_eq!(a.order_id, "1");
        assert_eq!(b.order_id, "2");
        assert_eq!(a.status, "FILLED");
    }

    #[tokio::test]
    async fn paper_fills_at_remembered_price_when_none_given() {
        let ex = PaperExchange::new();
        ex.ensure_instrument("ethusdt").await;
        assert_eq!(ex.fetch_price("ETHUSDT").await.unwrap(), PAPER_DEFAULT_PRICE);

        ex.set_price("ETHUSDT", 2_500.0);
        let fill = ex.place_order("ETHUSDT", Side::Buy, 0.5, None).await.unwrap();
        assert!((fill.price - 2_500.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn paper_balance_seeded_in_quote_only() {
        let ex = PaperExchange::new();
        assert!((ex.fetch_balance("USDT").await.unwrap() - PAPER_QUOTE_BALANCE).abs() < f64::EPSILON);
        assert_eq!(ex.fetch_balance("BTC").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn venue_adapter_rejects_order_routing() {
        let client = Arc::new(VenueClient::new("https://example.invalid", 1));
        let ex = VenueExchange::new(client);
        let err = ex
            .place_order("BTCUSDT", Side::Buy, 1.0, Some(1.0))
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeError::Unsupported("place_order"));
        assert_eq!(
            ex.fetch_balance("USDT").await.unwrap_err(),
            ExchangeError::Unsupported("fetch_balance")
        );
    }
}
