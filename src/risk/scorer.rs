use crate::config::{EngineConfig, RiskWeights, SourceReliability};
use crate::models::{AssetDescriptor, MarketData, PriceQuote, RiskMetrics};

/// Converts market and feed signals into a bounded risk estimate
///
/// `score` is a pure function of its inputs and never fails; degenerate
/// inputs normalize to maximum risk instead of propagating NaN.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    weights: RiskWeights,
    reliability: SourceReliability,
    wallet_risk_floor: f64,
    market_cap_reference: f64,
    intended_trade_size: f64,
}

impl RiskScorer {
    pub fn new(
        weights: RiskWeights,
        reliability: SourceReliability,
        wallet_risk_floor: f64,
        market_cap_reference: f64,
        intended_trade_size: f64,
    ) -> Self {
        Self {
            weights,
            reliability,
            wallet_risk_floor,
            market_cap_reference,
            intended_trade_size,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.risk_weights.clone(),
            config.source_reliability.clone(),
            config.wallet_risk_floor,
            config.market_cap_reference_usd,
            config.max_position_size,
        )
    }

    pub fn score(
        &self,
        asset: &AssetDescriptor,
        market: &MarketData,
        quote: &PriceQuote,
        wallet_flagged: bool,
    ) -> RiskMetrics {
        let volatility = market.price_change_24h.abs() / 100.0;
        let liquidity_depth = market.liquidity_usd / market.volume_24h.max(1.0);
        let market_cap = quote.price * asset.total_supply;
        let price_feed_reliability = self.reliability.get(quote.source) * quote.confidence;

        let slippage_estimate = if liquidity_depth > 0.0 && liquidity_depth.is_finite() {
            (self.intended_trade_size / liquidity_depth).min(1.0)
        } else {
            1.0
        };

        let wallet_risk = if wallet_flagged {
            1.0
        } else {
            self.wallet_risk_floor
        };

        let w = &self.weights;
        let weighted = w.volatility * unit(volatility)
            + w.liquidity_depth * inverse(liquidity_depth, 1.0)
            + w.market_cap * inverse(market_cap, self.market_cap_reference)
            + w.price_feed_reliability * (1.0 - unit(price_feed_reliability))
            + w.slippage * unit(slippage_estimate)
            + w.wallet * unit(wallet_risk);

        let overall_risk = if weighted.is_finite() {
            weighted.clamp(0.0, 1.0)
        } else {
            1.0
        };

        RiskMetrics {
            volatility,
            liquidity_depth,
            market_cap,
            price_feed_reliability,
            slippage_estimate,
            wallet_risk,
            overall_risk,
        }
    }
}

/// Clamp into [0, 1]; garbage counts as worst case
fn unit(value: f64) -> f64 {
    if value.is_nan() {
        return 1.0;
    }
    value.clamp(0.0, 1.0)
}

/// Larger-is-safer metric mapped to risk: 1 / (1 + value / reference)
fn inverse(value: f64, reference: f64) -> f64 {
    if !value.is_finite() || value < 0.0 || reference <= 0.0 {
        return 1.0;
    }
    1.0 / (1.0 + value / reference)
}
