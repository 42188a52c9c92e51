use std::sync::Arc;
use std::time::Duration;

use crate::api::PriceProvider;
use crate::error::{EngineError, ProviderFailure};
use crate::models::{PriceQuote, PriceSource};
use crate::resilience::{Resilience, TtlCache};
use crate::Result;

/// Multi-source price aggregator
///
/// Providers are tried in priority order; the first usable quote wins and is
/// cached per asset. Concurrent misses for the same asset may both go
/// upstream; there is no request coalescing.
pub struct PriceAggregator {
    providers: Vec<Arc<dyn PriceProvider>>,
    cache: TtlCache<String, PriceQuote>,
    resilience: Resilience,
}

impl PriceAggregator {
    pub fn new(
        providers: Vec<Arc<dyn PriceProvider>>,
        cache_ttl: Duration,
        resilience: Resilience,
    ) -> Self {
        Self {
            providers,
            cache: TtlCache::new(cache_ttl),
            resilience,
        }
    }

    /// Sources in the order they are tried
    pub fn providers(&self) -> Vec<PriceSource> {
        self.providers.iter().map(|p| p.source()).collect()
    }

    /// Fresh cached quote, if any
    pub fn cached(&self, asset_id: &str) -> Option<PriceQuote> {
        self.cache.get(&asset_id.to_string())
    }

    pub fn invalidate(&self, asset_id: &str) {
        self.cache.invalidate(&asset_id.to_string());
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Current price for an asset, from cache or the first healthy provider
    pub async fn get_price(&self, asset_id: &str) -> Result<PriceQuote> {
        if let Some(quote) = self.cached(asset_id) {
            tracing::debug!(asset = %asset_id, source = %quote.source, "Price cache hit");
            return Ok(quote);
        }

        let mut failures = Vec::new();

        for provider in &self.providers {
            let source = provider.source();
            let key = source.as_str();

            // Open breaker: skip without spending an attempt
            if self.resilience.is_open(key) {
                failures.push(ProviderFailure {
                    source,
                    reason: "circuit open".to_string(),
                });
                continue;
            }

            let result = self
                .resilience
                .call(key, |_| {
                    let provider = provider.clone();
                    async move {
                        match provider.get_current_price(asset_id).await? {
                            Some(quote) if quote.is_usable() => Ok(quote),
                            Some(quote) => Err(EngineError::provider(
                                key,
                                format!(
                                    "unusable quote (price {}, confidence {})",
                                    quote.price, quote.confidence
                                ),
                            )),
                            None => Err(EngineError::provider(key, "no quote")),
                        }
                    }
                })
                .await;

            match result {
                Ok(quote) => {
                    tracing::info!(
                        asset = %asset_id,
                        source = %source,
                        price = quote.price,
                        "Fetched price quote"
                    );
                    self.store(asset_id, quote.clone());
                    return Ok(quote);
                }
                Err(e) => {
                    tracing::warn!(asset = %asset_id, source = %source, "Price provider failed: {}", e);
                    failures.push(ProviderFailure {
                        source,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(EngineError::AllProvidersFailed {
            asset: asset_id.to_string(),
            failures,
        })
    }

    /// Never replace a cached quote from the same source with an older one
    fn store(&self, asset_id: &str, quote: PriceQuote) {
        self.cache.insert_if(asset_id.to_string(), quote, |cached, incoming| {
            cached.source == incoming.source && cached.timestamp > incoming.timestamp
        });
    }
}
