use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::PriceProvider;
use crate::error::EngineError;
use crate::models::{PriceQuote, PriceSource};
use crate::Result;

// Jupiter Price API v2
// Docs: https://dev.jup.ag/docs/price-api
const JUPITER_PRICE_API: &str = "https://lite-api.jup.ag";

/// Client for Jupiter price API
#[derive(Clone)]
pub struct JupiterClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(default)]
    data: HashMap<String, Option<PriceEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceEntry {
    price: Option<String>,
    #[serde(default)]
    extra_info: Option<ExtraInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtraInfo {
    #[serde(default)]
    confidence_level: Option<String>,
}

/// Confidence from Jupiter's own rating of the derived price
fn confidence_from_level(level: Option<&str>) -> f64 {
    match level {
        Some("high") => 1.0,
        Some("medium") => 0.7,
        Some("low") => 0.4,
        _ => 0.5,
    }
}

impl JupiterClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(JUPITER_PRICE_API, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Get the USD price and confidence for a mint, `None` if Jupiter has no price
    pub async fn get_price(&self, mint: &str) -> anyhow::Result<Option<(f64, f64)>> {
        let url = format!(
            "{}/price/v2?ids={}&showExtraInfo=true",
            self.base_url, mint
        );
        tracing::debug!("URL: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Jupiter API error: {}", response.status());
        }

        let mut body: PriceResponse = response
            .json()
            .await
            .context("Failed to decode Jupiter price response")?;

        let Some(entry) = body.data.remove(mint).flatten() else {
            return Ok(None);
        };
        let Some(price) = entry.price else {
            return Ok(None);
        };

        let price: f64 = price.parse().context("Unparseable Jupiter price")?;
        let confidence = confidence_from_level(
            entry
                .extra_info
                .as_ref()
                .and_then(|info| info.confidence_level.as_deref()),
        );

        Ok(Some((price, confidence)))
    }
}

#[async_trait]
impl PriceProvider for JupiterClient {
    fn source(&self) -> PriceSource {
        PriceSource::Jupiter
    }

    async fn get_current_price(&self, asset_id: &str) -> Result<Option<PriceQuote>> {
        let price = self
            .get_price(asset_id)
            .await
            .map_err(|e| EngineError::provider(self.source().as_str(), format!("{:#}", e)))?;

        Ok(price.map(|(price, confidence)| PriceQuote {
            price,
            source: PriceSource::Jupiter,
            timestamp: Utc::now(),
            confidence,
        }))
    }
}
