// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod execution;
pub mod models;
pub mod resilience;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{EngineSettings, EntryCycleReport, TradingEngine};
pub use error::EngineError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
