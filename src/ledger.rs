// =============================================================================
// Paper-Trading Ledger — simulated fills with average-cost positions
// =============================================================================
//
// Every accepted order is recorded as a FILLED row and applied to its
// instrument's position in one atomic read-modify-write. Positions never go
// short: sells floor the quantity at zero, and a flat position resets its
// average price to zero.
//
// Locking: the position table itself is only locked long enough to look up
// (or create) an instrument's entry; the accounting runs under that
// instrument's own mutex. Orders on different instruments never serialise
// against each other.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// A filled simulated order. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub status: String,
    /// ISO 8601 timestamp.
    pub ts: String,
}

/// Net holding for one instrument. Invariant: qty == 0 implies avg_price == 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    /// ISO 8601 timestamp of the last applied order.
    pub updated_at: String,
}

/// Synchronous rejections surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Thread-safe order log and position table.
pub struct Ledger {
    orders: RwLock<Vec<Order>>,
    positions: RwLock<HashMap<String, Arc<Mutex<Position>>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(Vec::new()),
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Execute a simulated order against the position ledger.
    ///
    /// BUY folds the fill into the volume-weighted average price; SELL
    /// reduces the quantity, flooring at zero and resetting the average
    /// price when the position goes flat. Correctness is independent of
    /// market-data freshness.
    pub fn execute_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<Order, LedgerError> {
        if !qty.is_finite() || qty <= 0.0 {
            return Err(LedgerError::InvalidOrder(format!(
                "quantity must be positive, got {qty}"
            )));
        }

        let symbol = symbol.to_uppercase();
        let now = Utc::now().to_rfc3339();

        let order = Order {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.clone(),
            side,
            qty,
            price,
            status: "FILLED".to_string(),
            ts: now.clone(),
        };

        self.orders.write().push(order.clone());

        let slot = self.position_slot(&symbol, &now);
        {
            // Atomic per-instrument read-modify-write.
            let mut pos = slot.lock();
            match side {
                Side::Buy => {
                    let new_qty = pos.qty + qty;
                    pos.avg_price = if new_qty != 0.0 {
                        (pos.avg_price * pos.qty + price * qty) / new_qty
                    } else {
                        0.0
                    };
                    pos.qty = new_qty;
                }
                Side::Sell => {
                    pos.qty = (pos.qty - qty).max(0.0);
                    if pos.qty == 0.0 {
                        pos.avg_price = 0.0;
                    }
                }
            }
            pos.updated_at = now;

            info!(
                order_id = %order.id,
                symbol = %symbol,
                side = %side,
                qty,
                price,
                position_qty = pos.qty,
                position_avg = pos.avg_price,
                "paper order filled"
            );
        }

        Ok(order)
    }

    /// Fetch or create the per-instrument position slot.
    fn position_slot(&self, symbol: &str, now: &str) -> Arc<Mutex<Position>> {
        if let Some(slot) = self.positions.read().get(symbol) {
            return slot.clone();
        }
        let mut positions = self.positions.write();
        positions
            .entry(symbol.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Position {
                    symbol: symbol.to_string(),
                    qty: 0.0,
                    avg_price: 0.0,
                    updated_at: now.to_string(),
                }))
            })
            .clone()
    }

    /// The most recent `limit` orders, newest first.
    pub fn list_orders(&self, limit: usize) -> Vec<Order> {
        self.orders
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// All positions, sorted by symbol. Flat positions are retained.
    pub fn list_positions(&self) -> Vec<Position> {
        let positions = self.positions.read();
        let mut out: Vec<Position> = positions.values().map(|slot| slot.lock().clone()).collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("orders", &self.orders.read().len())
            .field("positions", &self.positions.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_cost_accounting_across_buys_and_sells() {
        let ledger = Ledger::new();

        ledger.execute_order("BTCUSDT", Side::Buy, 2.0, 100.0).unwrap();
        let positions = ledger.list_positions();
        assert!((positions[0].qty - 2.0).abs() < f64::EPSILON);
        assert!((positions[0].avg_price - 100.0).abs() < f64::EPSILON);

        ledger.execute_order("BTCUSDT", Side::Buy, 1.0, 130.0).unwrap();
        let positions = ledger.list_positions();
        assert!((positions[0].qty - 3.0).abs() < f64::EPSILON);
        assert!((positions[0].avg_price - 110.0).abs() < 1e-9);

        ledger.execute_order("BTCUSDT", Side::Sell, 3.0, 150.0).unwrap();
        let positions = ledger.list_positions();
        assert_eq!(positions[0].qty, 0.0);
        assert_eq!(positions[0].avg_price, 0.0);
    }

    #[test]
    fn sell_floors_quantity_at_zero() {
        let ledger = Ledger::new();
        ledger.execute_order("ETHUSDT", Side::Buy, 1.0, 50.0).unwrap();
        ledger.execute_order("ETHUSDT", Side::Sell, 5.0, 60.0).unwrap();

        let positions = ledger.list_positions();
        assert_eq!(positions[0].qty, 0.0);
        assert_eq!(positions[0].avg_price, 0.0);
    }

    #[test]
    fn sell_into_missing_position_creates_flat_row() {
        let ledger = Ledger::new();
        ledger.execute_order("XRPUSDT", Side::Sell, 2.0, 1.0).unwrap();

        let positions = ledger.list_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty, 0.0);
        assert_eq!(positions[0].avg_price, 0.0);
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        let ledger = Ledger::new();
        assert!(ledger.execute_order("BTCUSDT", Side::Buy, 0.0, 100.0).is_err());
        assert!(ledger.execute_order("BTCUSDT", Side::Buy, -1.0, 100.0).is_err());
        assert!(ledger
            .execute_order("BTCUSDT", Side::Buy, f64::NAN, 100.0)
            .is_err());
        assert!(ledger.list_orders(10).is_empty());
        assert!(ledger.list_positions().is_empty());
    }

    #[test]
    fn orders_list_newest_first() {
        let ledger = Ledger::new();
        ledger.execute_order("BTCUSDT", Side::Buy, 1.0, 100.0).unwrap();
        ledger.execute_order("ETHUSDT", Side::Buy, 1.0, 10.0).unwrap();
        ledger.execute_order("BTCUSDT", Side::Sell, 1.0, 110.0).unwrap();

        let orders = ledger.list_orders(2);
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[1].symbol, "ETHUSDT");
        assert!(orders.iter().all(|o| o.status == "FILLED"));
    }

    #[test]
    fn positions_are_isolated_per_symbol() {
        let ledger = Ledger::new();
        ledger.execute_order("BTCUSDT", Side::Buy, 1.0, 100.0).unwrap();
        ledger.execute_order("ETHUSDT", Side::Buy, 2.0, 10.0).unwrap();
        ledger.execute_order("BTCUSDT", Side::Sell, 1.0, 120.0).unwrap();

        let positions = ledger.list_positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].symbol, "BTCUSDT");
        assert_eq!(positions[0].qty, 0.0);
        assert_eq!(positions[1].symbol, "ETHUSDT");
        assert!((positions[1].qty - 2.0).abs() < f64::EPSILON);
        assert!((positions[1].avg_price - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrent_orders_on_one_symbol_lose_no_updates() {
        let ledger = Arc::new(Ledger::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    ledger
                        .execute_order("BTCUSDT", Side::Buy, 1.0, 100.0)
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let positions = ledger.list_positions();
        assert!((positions[0].qty - 800.0).abs() < f64::EPSILON);
        assert!((positions[0].avg_price - 100.0).abs() < 1e-9);
        assert_eq!(ledger.list_orders(10_000).len(), 800);
    }
}
