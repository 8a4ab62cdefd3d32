pub mod backoff;
pub mod client;
pub mod stream;

pub use client::{Kline, TickerStats, VenueClient};
pub use stream::{DepthStream, DepthUpdate};

use async_trait::async_trait;

/// Upstream market-data capability consumed by the caches. Implemented by
/// [`VenueClient`]; test code substitutes scripted sources.
///
/// Both methods follow the connector contract: failure degrades to an empty
/// sequence, never an error.
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Tradable instrument identifiers (empty on upstream failure).
    async fn fetch_universe(&self) -> Vec<String>;

    /// 24-hour statistics for the given instruments (empty on failure).
    async fn fetch_24h_stats(&self, symbols: &[String]) -> Vec<TickerStats>;
}

#[async_trait]
impl MarketSource for VenueClient {
    async fn fetch_universe(&self) -> Vec<String> {
        VenueClient::fetch_universe(self).await
    }

    async fn fetch_24h_stats(&self, symbols: &[String]) -> Vec<TickerStats> {
        VenueClient::fetch_24h_stats(self, symbols).await
    }
}
