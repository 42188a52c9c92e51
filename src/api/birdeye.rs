use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::PriceProvider;
use crate::discovery::CandidateSource;
use crate::error::EngineError;
use crate::models::{AssetDescriptor, Opportunity, PriceQuote, PriceSource};
use crate::Result;

const BIRDEYE_API_BASE: &str = "https://public-api.birdeye.so";
const RATE_LIMIT_RPS: u32 = 1; // Free tier: 1 request per second
const TRENDING_LIMIT: usize = 20;
const PRICE_CONFIDENCE: f64 = 0.9;
const NO_LIQUIDITY_CONFIDENCE: f64 = 0.6;

type BirdeyeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for Birdeye API (Solana data)
///
/// **FREE TIER LIMITATIONS:**
/// - Only `/defi/price` and `/defi/token_trending` are available
/// - 1 request per second, enforced client-side
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct BirdeyeClient {
    client: Client,
    api_key: String,
    base_url: String,
    rate_limiter: Arc<BirdeyeRateLimiter>,
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct BirdeyeResponse<T> {
    data: Option<T>,
    success: bool,
}

#[derive(Debug, Deserialize)]
struct PriceData {
    value: Option<f64>,
    #[serde(default)]
    liquidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TrendingData {
    tokens: Vec<TrendingTokenRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrendingTokenRaw {
    address: String,
    symbol: String,
    name: String,
    decimals: u8,
    #[serde(default)]
    liquidity: Option<f64>,
    #[serde(rename = "volume24hUSD", default)]
    volume_24h_usd: Option<f64>,
    #[serde(default)]
    marketcap: Option<f64>,
    rank: Option<u32>,
    #[serde(default)]
    price: Option<f64>,
}

// ============== Public Types ==============

#[derive(Debug, Clone)]
pub struct TrendingToken {
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub liquidity_usd: f64,
    pub volume_24h_usd: f64,
    pub marketcap: f64,
    pub rank: u32,
    pub price: f64,
}

impl From<TrendingTokenRaw> for TrendingToken {
    fn from(raw: TrendingTokenRaw) -> Self {
        TrendingToken {
            address: raw.address,
            symbol: raw.symbol,
            name: raw.name,
            decimals: raw.decimals,
            liquidity_usd: raw.liquidity.unwrap_or(0.0),
            volume_24h_usd: raw.volume_24h_usd.unwrap_or(0.0),
            marketcap: raw.marketcap.unwrap_or(0.0),
            rank: raw.rank.unwrap_or(9999),
            price: raw.price.unwrap_or(0.0),
        }
    }
}

impl TrendingToken {
    /// Decode into an opportunity, rejecting rows with unusable numbers
    pub fn into_opportunity(self) -> Option<Opportunity> {
        let total_supply = if self.price > 0.0 && self.marketcap.is_finite() {
            self.marketcap / self.price
        } else {
            0.0
        };

        let asset = AssetDescriptor {
            id: self.address,
            symbol: self.symbol,
            name: self.name,
            decimals: self.decimals,
            total_supply,
            holder_count: 0, // Not on the free tier
            social_score: 0.0,
        };

        match asset.validate() {
            Ok(()) => Some(Opportunity::Trending {
                asset,
                rank: self.rank,
            }),
            Err(e) => {
                tracing::debug!("Dropping trending row: {}", e);
                None
            }
        }
    }
}

// ============== Implementation ==============

impl BirdeyeClient {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        Self::with_base_url(api_key, BIRDEYE_API_BASE, timeout)
    }

    pub fn with_base_url(api_key: String, base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap_or(NonZeroU32::MIN));

        Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> anyhow::Result<Option<T>> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(url)
            .header("X-API-KEY", &self.api_key)
            .header("x-chain", "solana")
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Birdeye API error: {}", response.status());
        }

        let body: BirdeyeResponse<T> = response
            .json()
            .await
            .context("Failed to decode Birdeye response")?;

        if !body.success {
            anyhow::bail!("Birdeye API returned success=false");
        }

        Ok(body.data)
    }

    /// Get current price and liquidity for a token
    /// Endpoint: GET /defi/price?address={address}&include_liquidity=true
    pub async fn get_price(&self, address: &str) -> anyhow::Result<Option<(f64, Option<f64>)>> {
        let url = format!(
            "{}/defi/price?address={}&include_liquidity=true",
            self.base_url, address
        );

        let data: Option<PriceData> = self.get_json(&url).await?;
        Ok(data.and_then(|d| d.value.map(|value| (value, d.liquidity))))
    }

    /// Get trending tokens
    /// Endpoint: GET /defi/token_trending?sort_by=rank&sort_type=asc&offset={offset}&limit={limit}
    pub async fn get_trending(&self, offset: usize, limit: usize) -> anyhow::Result<Vec<TrendingToken>> {
        let url = format!(
            "{}/defi/token_trending?sort_by=rank&sort_type=asc&offset={}&limit={}",
            self.base_url, offset, limit
        );

        let data: Option<TrendingData> = self.get_json(&url).await?;
        Ok(data
            .map(|d| d.tokens.into_iter().map(TrendingToken::from).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl PriceProvider for BirdeyeClient {
    fn source(&self) -> PriceSource {
        PriceSource::Birdeye
    }

    async fn get_current_price(&self, asset_id: &str) -> Result<Option<PriceQuote>> {
        let price = self
            .get_price(asset_id)
            .await
            .map_err(|e| EngineError::provider(self.source().as_str(), format!("{:#}", e)))?;

        Ok(price.map(|(value, liquidity)| PriceQuote {
            price: value,
            source: PriceSource::Birdeye,
            timestamp: Utc::now(),
            confidence: if liquidity.is_some() {
                PRICE_CONFIDENCE
            } else {
                NO_LIQUIDITY_CONFIDENCE
            },
        }))
    }
}

#[async_trait]
impl CandidateSource for BirdeyeClient {
    fn name(&self) -> &str {
        "birdeye_trending"
    }

    async fn fetch_candidates(&self) -> Result<Vec<Opportunity>> {
        let trending = self
            .get_trending(0, TRENDING_LIMIT)
            .await
            .map_err(|e| EngineError::provider("birdeye_trending", format!("{:#}", e)))?;

        Ok(trending
            .into_iter()
            .filter_map(TrendingToken::into_opportunity)
            .collect())
    }
}
