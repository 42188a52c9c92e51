pub mod birdeye;
pub mod dexscreener;
pub mod jupiter;

pub use birdeye::{BirdeyeClient, TrendingToken};
pub use dexscreener::{DexScreenerClient, PairSnapshot};
pub use jupiter::JupiterClient;

use async_trait::async_trait;

use crate::models::{AssetDescriptor, MarketData, PriceQuote, PriceSource};
use crate::Result;

/// A single upstream price feed
///
/// Implementations make one attempt per call; retries and circuit breaking
/// are applied by the caller.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    fn source(&self) -> PriceSource;

    /// `Ok(None)` when the provider has no price for the asset
    async fn get_current_price(&self, asset_id: &str) -> Result<Option<PriceQuote>>;
}

/// 24h market statistics for an asset
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn get_market_data(&self, asset: &AssetDescriptor) -> Result<MarketData>;
}
