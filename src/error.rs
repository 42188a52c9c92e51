use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::models::PriceSource;

/// One provider's reason for not producing a quote
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub source: PriceSource,
    pub reason: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("All price providers failed for {asset}: [{}]", format_failures(.failures))]
    AllProvidersFailed {
        asset: String,
        failures: Vec<ProviderFailure>,
    },

    #[error("Circuit open for {key} (retry in {retry_in:?})")]
    CircuitOpen { key: String, retry_in: Duration },

    #[error("Scoring oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    #[error("Bad actor registry error: {0}")]
    Registry(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Per-asset failures the batch can skip over. Repository and config
    /// errors abort the current cycle instead.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::Repository(_) | EngineError::Config(_))
    }

    pub fn provider(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

fn format_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Repository(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Repository(format!("migration failed: {}", err))
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::Registry(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
