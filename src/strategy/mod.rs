// Entry signal generation
pub mod oracle;
pub mod signals;

pub use oracle::{build_features, HttpScoringOracle, ScoringOracle, FEATURE_COUNT};
pub use signals::{SignalConfig, SignalGenerator};
