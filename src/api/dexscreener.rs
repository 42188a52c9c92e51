use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{MarketDataSource, PriceProvider};
use crate::error::EngineError;
use crate::models::{AssetDescriptor, MarketData, PriceQuote, PriceSource};
use crate::Result;

const DEXSCREENER_API_BASE: &str = "https://api.dexscreener.com";
const DEFAULT_CHAIN: &str = "solana";
const FULL_CONFIDENCE_LIQUIDITY_USD: f64 = 1_000_000.0;

/// Client for DexScreener API
#[derive(Clone)]
pub struct DexScreenerClient {
    client: Client,
    base_url: String,
    chain_id: String,
}

#[derive(Debug, Deserialize)]
struct DexScreenerResponse {
    #[serde(default)]
    pairs: Option<Vec<PairData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairData {
    chain_id: String,
    #[serde(default)]
    price_usd: Option<String>,
    #[serde(default)]
    volume: Option<VolumeData>,
    #[serde(default)]
    liquidity: Option<LiquidityData>,
    #[serde(default)]
    price_change: Option<PriceChange>,
}

#[derive(Debug, Deserialize)]
struct VolumeData {
    #[serde(default)]
    h24: f64,
}

#[derive(Debug, Deserialize)]
struct LiquidityData {
    #[serde(default)]
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PriceChange {
    #[serde(default)]
    h24: Option<f64>,
}

/// Most liquid pair for a token on the configured chain
#[derive(Debug, Clone, PartialEq)]
pub struct PairSnapshot {
    pub price_usd: f64,
    pub volume_24h: f64,
    pub liquidity_usd: f64,
    pub price_change_24h: f64,
}

impl DexScreenerClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(DEXSCREENER_API_BASE, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            chain_id: DEFAULT_CHAIN.to_string(),
        }
    }

    /// Fetch the deepest pair for a token (single attempt; callers retry)
    pub async fn get_pair(&self, token_address: &str) -> anyhow::Result<PairSnapshot> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, token_address);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("DexScreener API error: {}", response.status());
        }

        let body: DexScreenerResponse = response
            .json()
            .await
            .context("Failed to decode DexScreener response")?;

        // Prefer the most liquid pair on our chain
        let pair = body
            .pairs
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.chain_id == self.chain_id)
            .max_by(|a, b| {
                let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                la.total_cmp(&lb)
            })
            .with_context(|| format!("No {} pair found for token", self.chain_id))?;

        let price_usd: f64 = pair
            .price_usd
            .as_deref()
            .context("Pair has no USD price")?
            .parse()
            .context("Unparseable USD price")?;

        Ok(PairSnapshot {
            price_usd,
            volume_24h: pair.volume.map(|v| v.h24).unwrap_or(0.0),
            liquidity_usd: pair.liquidity.and_then(|l| l.usd).unwrap_or(0.0),
            price_change_24h: pair.price_change.and_then(|c| c.h24).unwrap_or(0.0),
        })
    }
}

/// Thin pools quote less reliably; full confidence at $1M liquidity
fn liquidity_confidence(liquidity_usd: f64) -> f64 {
    (liquidity_usd / FULL_CONFIDENCE_LIQUIDITY_USD).clamp(0.0, 1.0)
}

#[async_trait]
impl PriceProvider for DexScreenerClient {
    fn source(&self) -> PriceSource {
        PriceSource::DexScreener
    }

    async fn get_current_price(&self, asset_id: &str) -> Result<Option<PriceQuote>> {
        let pair = self
            .get_pair(asset_id)
            .await
            .map_err(|e| EngineError::provider(self.source().as_str(), format!("{:#}", e)))?;

        Ok(Some(PriceQuote {
            price: pair.price_usd,
            source: PriceSource::DexScreener,
            timestamp: Utc::now(),
            confidence: liquidity_confidence(pair.liquidity_usd),
        }))
    }
}

#[async_trait]
impl MarketDataSource for DexScreenerClient {
    async fn get_market_data(&self, asset: &AssetDescriptor) -> Result<MarketData> {
        let pair = self
            .get_pair(&asset.id)
            .await
            .map_err(|e| EngineError::provider("market_data", format!("{:#}", e)))?;

        Ok(MarketData {
            price: pair.price_usd,
            volume_24h: pair.volume_24h,
            liquidity_usd: pair.liquidity_usd,
            price_change_24h: pair.price_change_24h,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

    fn pairs_body() -> &'static str {
        r#"{
            "pairs": [
                {
                    "chainId": "ethereum",
                    "priceUsd": "1.00",
                    "volume": {"h24": 1.0},
                    "liquidity": {"usd": 99999999.0},
                    "priceChange": {"h24": 0.0}
                },
                {
                    "chainId": "solana",
                    "priceUsd": "150.25",
                    "volume": {"h24": 2500000.0},
                    "liquidity": {"usd": 500000.0},
                    "priceChange": {"h24": -4.5}
                },
                {
                    "chainId": "solana",
                    "priceUsd": "150.10",
                    "volume": {"h24": 9000000.0},
                    "liquidity": {"usd": 2000000.0},
                    "priceChange": {"h24": -4.2}
                }
            ]
        }"#
    }

    #[tokio::test]
    async fn test_picks_deepest_pair_on_chain() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", format!("/latest/dex/tokens/{}", SOL_MINT).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(pairs_body())
            .create_async()
            .await;

        let client = DexScreenerClient::with_base_url(server.url(), Duration::from_secs(5));
        let pair = client.get_pair(SOL_MINT).await.unwrap();

        assert_eq!(pair.price_usd, 150.10);
        assert_eq!(pair.liquidity_usd, 2_000_000.0);
        assert_eq!(pair.price_change_24h, -4.2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_quote_confidence_from_liquidity() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", format!("/latest/dex/tokens/{}", SOL_MINT).as_str())
            .with_status(200)
            .with_body(pairs_body())
            .create_async()
            .await;

        let client = DexScreenerClient::with_base_url(server.url(), Duration::from_secs(5));
        let quote = client.get_current_price(SOL_MINT).await.unwrap().unwrap();

        assert_eq!(quote.source, PriceSource::DexScreener);
        assert_eq!(quote.confidence, 1.0);
        assert!(quote.is_usable());
    }

    #[tokio::test]
    async fn test_market_data_mapping() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", format!("/latest/dex/tokens/{}", SOL_MINT).as_str())
            .with_status(200)
            .with_body(pairs_body())
            .create_async()
            .await;

        let client = DexScreenerClient::with_base_url(server.url(), Duration::from_secs(5));
        let asset = AssetDescriptor::new(SOL_MINT, "SOL");
        let market = client.get_market_data(&asset).await.unwrap();

        assert_eq!(market.volume_24h, 9_000_000.0);
        assert_eq!(market.liquidity_usd, 2_000_000.0);
    }

    #[tokio::test]
    async fn test_missing_pairs_is_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/latest/dex/tokens/unknown")
            .with_status(200)
            .with_body(r#"{"pairs": null}"#)
            .create_async()
            .await;

        let client = DexScreenerClient::with_base_url(server.url(), Duration::from_secs(5));
        let err = client.get_current_price("unknown").await.unwrap_err();

        assert!(matches!(err, EngineError::ProviderUnavailable { .. }));
        assert!(err.to_string().contains("No solana pair"));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/latest/dex/tokens/abc")
            .with_status(503)
            .create_async()
            .await;

        let client = DexScreenerClient::with_base_url(server.url(), Duration::from_secs(5));
        assert!(client.get_pair("abc").await.is_err());
    }

    #[test]
    fn test_liquidity_confidence_bounds() {
        assert_eq!(liquidity_confidence(0.0), 0.0);
        assert_eq!(liquidity_confidence(250_000.0), 0.25);
        assert_eq!(liquidity_confidence(5_000_000.0), 1.0);
    }
}
