use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::error::EngineError;
use crate::models::{AssetDescriptor, PriceSource};
use crate::resilience::RetryPolicy;
use crate::Result;

pub const ENV_PREFIX: &str = "SIGNALBOT";
pub const DEFAULT_CONFIG_PATH: &str = "config/signalbot.toml";

/// Weights combining normalized risk sub-metrics (must sum to 1.0)
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskWeights {
    pub volatility: f64,
    pub liquidity_depth: f64,
    pub market_cap: f64,
    pub price_feed_reliability: f64,
    pub slippage: f64,
    pub wallet: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            volatility: 0.2,
            liquidity_depth: 0.2,
            market_cap: 0.1,
            price_feed_reliability: 0.2,
            slippage: 0.2,
            wallet: 0.1,
        }
    }
}

impl RiskWeights {
    pub fn total(&self) -> f64 {
        self.volatility
            + self.liquidity_depth
            + self.market_cap
            + self.price_feed_reliability
            + self.slippage
            + self.wallet
    }
}

/// Base reliability per price provider, before quote confidence
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceReliability {
    pub jupiter: f64,
    pub birdeye: f64,
    pub dexscreener: f64,
}

impl Default for SourceReliability {
    fn default() -> Self {
        Self {
            jupiter: 0.95,     // Aggregated across venues
            birdeye: 0.90,
            dexscreener: 0.85, // Single-pair price
        }
    }
}

impl SourceReliability {
    pub fn get(&self, source: PriceSource) -> f64 {
        match source {
            PriceSource::Jupiter => self.jupiter,
            PriceSource::Birdeye => self.birdeye,
            PriceSource::DexScreener => self.dexscreener,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WatchlistEntry {
    pub id: String,
    pub symbol: String,
}

impl WatchlistEntry {
    pub fn to_asset(&self) -> AssetDescriptor {
        AssetDescriptor::new(self.id.clone(), self.symbol.clone())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    // Signal generation
    pub confidence_threshold: f64,
    pub min_liquidity_usd: f64,
    pub max_position_size: f64,
    pub min_position_size: f64,
    pub max_slippage_bps: u32,
    pub risk_free_rate: f64,

    // Exit rules
    pub take_profit_threshold: f64,
    pub stop_loss_threshold: f64,
    pub max_holding_time_secs: u64,

    // Risk scoring
    pub risk_weights: RiskWeights,
    pub source_reliability: SourceReliability,
    pub wallet_risk_floor: f64,
    pub market_cap_reference_usd: f64,

    // Resilience
    pub price_cache_ttl_ms: u64,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub http_timeout_ms: u64,

    // Scheduling
    pub entry_interval_secs: u64,
    pub exit_interval_secs: u64,
    pub discovery_interval_secs: u64,
    pub max_concurrent_evaluations: usize,

    // Collaborators
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub birdeye_api_key: Option<String>,
    pub oracle_url: Option<String>,
    pub jupiter_base_url: Option<String>,
    pub birdeye_base_url: Option<String>,
    pub dexscreener_base_url: Option<String>,
    pub bad_actors: Vec<String>,
    pub watchlist: Vec<WatchlistEntry>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.67,
            min_liquidity_usd: 10_000.0,
            max_position_size: 1.0,
            min_position_size: 0.01,
            max_slippage_bps: 150,
            risk_free_rate: 0.02,
            take_profit_threshold: 0.15,
            stop_loss_threshold: -0.10,
            max_holding_time_secs: 3600,
            risk_weights: RiskWeights::default(),
            source_reliability: SourceReliability::default(),
            wallet_risk_floor: 0.1,
            market_cap_reference_usd: 1_000_000.0,
            price_cache_ttl_ms: 60_000,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout_ms: 60_000,
            retry_max_attempts: 3,
            retry_initial_backoff_ms: 250,
            retry_max_backoff_ms: 5_000,
            http_timeout_ms: 10_000,
            entry_interval_secs: 60,
            exit_interval_secs: 30,
            discovery_interval_secs: 1800,
            max_concurrent_evaluations: 8,
            database_url: None,
            redis_url: None,
            birdeye_api_key: None,
            oracle_url: None,
            jupiter_base_url: None,
            birdeye_base_url: None,
            dexscreener_base_url: None,
            bad_actors: Vec::new(),
            watchlist: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML file layered under `SIGNALBOT_*` env vars
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SIGNALBOT_RISK_WEIGHTS__VOLATILITY=0.3`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, message: impl std::fmt::Display) -> Result<()> {
            Err(EngineError::Config(format!("{}: {}", field, message)))
        }

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return invalid("confidence_threshold", "must be within [0, 1]");
        }
        if self.min_liquidity_usd < 0.0 {
            return invalid("min_liquidity_usd", "must not be negative");
        }
        if self.max_position_size <= 0.0 {
            return invalid("max_position_size", "must be positive");
        }
        if self.min_position_size < 0.0 || self.min_position_size > self.max_position_size {
            return invalid(
                "min_position_size",
                format!("must be within [0, {}]", self.max_position_size),
            );
        }
        if self.take_profit_threshold <= 0.0 {
            return invalid("take_profit_threshold", "must be positive");
        }
        if self.stop_loss_threshold >= 0.0 || self.stop_loss_threshold <= -1.0 {
            return invalid("stop_loss_threshold", "must be within (-1, 0)");
        }
        if self.max_holding_time_secs == 0 {
            return invalid("max_holding_time_secs", "must be positive");
        }
        if (self.risk_weights.total() - 1.0).abs() > 1e-6 {
            return invalid(
                "risk_weights",
                format!("must sum to 1.0 (got {:.4})", self.risk_weights.total()),
            );
        }
        if self.price_cache_ttl_ms == 0 {
            return invalid("price_cache_ttl_ms", "must be positive");
        }
        if self.circuit_breaker_failure_threshold == 0 {
            return invalid("circuit_breaker_failure_threshold", "must be positive");
        }
        if self.max_concurrent_evaluations == 0 {
            return invalid("max_concurrent_evaluations", "must be positive");
        }

        Ok(())
    }

    pub fn price_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.price_cache_ttl_ms)
    }

    pub fn circuit_breaker_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_reset_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn max_holding_time(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_holding_time_secs as i64)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }
}
