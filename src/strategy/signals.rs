use chrono::Utc;
use std::sync::Arc;

use super::oracle::{build_features, ScoringOracle};
use crate::api::MarketDataSource;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::PriceAggregator;
use crate::models::{AssetDescriptor, TradeAction, TradeSignal};
use crate::resilience::Resilience;
use crate::risk::{BadActorRegistry, RiskScorer};
use crate::Result;

const MARKET_DATA_KEY: &str = "market_data";
const ORACLE_KEY: &str = "oracle";
const MIN_VOLATILITY: f64 = 1e-9;

/// Configuration for signal generation
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub confidence_threshold: f64,
    pub min_liquidity_usd: f64,
    pub max_position_size: f64,
    pub min_position_size: f64,
    pub max_slippage_bps: u32,
    pub risk_free_rate: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SignalConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            min_liquidity_usd: config.min_liquidity_usd,
            max_position_size: config.max_position_size,
            min_position_size: config.min_position_size,
            max_slippage_bps: config.max_slippage_bps,
            risk_free_rate: config.risk_free_rate,
        }
    }
}

impl SignalConfig {
    /// Position size scaled by confidence, calmness and liquidity depth
    pub fn position_size(&self, confidence: f64, volatility: f64, liquidity_depth: f64) -> f64 {
        let raw = self.max_position_size
            * confidence
            * (1.0 - volatility)
            * (liquidity_depth / 2.0).min(1.0);

        if raw.is_nan() {
            return self.min_position_size;
        }
        raw.clamp(self.min_position_size, self.max_position_size)
    }
}

/// Turns a candidate asset into a sized entry signal, or rejects it
///
/// Steps run strictly in order: market data, price, oracle confidence,
/// bad-actor lookup, risk, gates, sizing.
pub struct SignalGenerator {
    market: Arc<dyn MarketDataSource>,
    prices: Arc<PriceAggregator>,
    oracle: Arc<dyn ScoringOracle>,
    bad_actors: Arc<dyn BadActorRegistry>,
    scorer: RiskScorer,
    config: SignalConfig,
    resilience: Resilience,
}

impl SignalGenerator {
    pub fn new(
        market: Arc<dyn MarketDataSource>,
        prices: Arc<PriceAggregator>,
        oracle: Arc<dyn ScoringOracle>,
        bad_actors: Arc<dyn BadActorRegistry>,
        scorer: RiskScorer,
        config: SignalConfig,
        resilience: Resilience,
    ) -> Self {
        Self {
            market,
            prices,
            oracle,
            bad_actors,
            scorer,
            config,
            resilience,
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// `Ok(None)` when the asset fails a gate; errors are scoped to this asset
    pub async fn evaluate(&self, asset: &AssetDescriptor) -> Result<Option<TradeSignal>> {
        let market = self
            .resilience
            .call(MARKET_DATA_KEY, |_| self.market.get_market_data(asset))
            .await?;

        let quote = self.prices.get_price(&asset.id).await?;

        let features = build_features(asset, &market, &quote);
        let confidence = self
            .resilience
            .call(ORACLE_KEY, |_| self.oracle.score(&features))
            .await
            .map_err(|e| match e {
                EngineError::OracleUnavailable(_) => e,
                other => EngineError::OracleUnavailable(other.to_string()),
            })?;

        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::InvalidMetric(format!(
                "oracle confidence {} for {} outside [0, 1]",
                confidence, asset.symbol
            )));
        }

        let wallet_flagged = match self.bad_actors.contains(&asset.id).await {
            Ok(flagged) => flagged,
            Err(e) => {
                tracing::warn!(asset = %asset.id, "Bad actor lookup failed, treating as flagged: {}", e);
                true
            }
        };

        let risk = self.scorer.score(asset, &market, &quote, wallet_flagged);

        if confidence < self.config.confidence_threshold
            || market.liquidity_usd < self.config.min_liquidity_usd
        {
            tracing::debug!(
                asset = %asset.symbol,
                confidence,
                liquidity = market.liquidity_usd,
                "Candidate below entry thresholds"
            );
            return Ok(None);
        }

        let slippage_bps = risk.slippage_estimate * 10_000.0;
        if slippage_bps > self.config.max_slippage_bps as f64 {
            tracing::debug!(
                asset = %asset.symbol,
                slippage_bps,
                max = self.config.max_slippage_bps,
                "Candidate rejected on slippage"
            );
            return Ok(None);
        }

        if risk.volatility < MIN_VOLATILITY {
            return Err(EngineError::InvalidMetric(format!(
                "volatility {} for {} too small for reward/risk",
                risk.volatility, asset.symbol
            )));
        }

        // Moves beyond 100% count as fully volatile for sizing and targets
        let volatility = risk.volatility.min(1.0);
        let suggested_size =
            self.config
                .position_size(confidence, volatility, risk.liquidity_depth);
        let expected_return = confidence * (1.0 - volatility) * 100.0;
        let max_drawdown = volatility * 200.0;
        let reward_to_risk = (confidence - self.config.risk_free_rate) / volatility;

        tracing::info!(
            asset = %asset.symbol,
            source = %quote.source,
            confidence,
            size = suggested_size,
            risk = risk.overall_risk,
            "📈 Entry signal"
        );

        Ok(Some(TradeSignal {
            asset: asset.clone(),
            action: TradeAction::Enter,
            confidence,
            price: quote.price,
            volume: market.volume_24h,
            suggested_size,
            risk,
            expected_return,
            max_drawdown,
            reward_to_risk,
            created_at: Utc::now(),
        }))
    }
}
