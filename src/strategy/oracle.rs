use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;
use crate::models::{AssetDescriptor, MarketData, PriceQuote};
use crate::Result;

/// Number of features handed to the oracle, in `build_features` order
pub const FEATURE_COUNT: usize = 8;

/// Opaque confidence model
///
/// Returns a score in [0, 1]; the caller validates the range.
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn score(&self, features: &[f64]) -> Result<f64>;
}

/// Feature vector in the order the model was trained on:
/// price, volume, liquidity, 24h change, holders, social score, decimals, supply
pub fn build_features(
    asset: &AssetDescriptor,
    market: &MarketData,
    quote: &PriceQuote,
) -> [f64; FEATURE_COUNT] {
    [
        quote.price,
        market.volume_24h,
        market.liquidity_usd,
        market.price_change_24h,
        asset.holder_count as f64,
        asset.social_score,
        asset.decimals as f64,
        asset.total_supply,
    ]
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    features: &'a [f64],
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    confidence: f64,
}

/// Model served over HTTP: `POST {base_url}/score`
#[derive(Clone)]
pub struct HttpScoringOracle {
    client: Client,
    base_url: String,
}

impl HttpScoringOracle {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn request(&self, features: &[f64]) -> anyhow::Result<f64> {
        let url = format!("{}/score", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&ScoreRequest { features })
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Oracle returned {}", response.status());
        }

        let body: ScoreResponse = response
            .json()
            .await
            .context("Failed to decode oracle response")?;

        Ok(body.confidence)
    }
}

#[async_trait]
impl ScoringOracle for HttpScoringOracle {
    async fn score(&self, features: &[f64]) -> Result<f64> {
        self.request(features)
            .await
            .map_err(|e| EngineError::OracleUnavailable(format!("{:#}", e)))
    }
}
