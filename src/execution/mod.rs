// Price aggregation, exit decisions and order execution
pub mod executor;
pub mod exit_evaluator;
pub mod price_feed;

pub use executor::{DryRunExecutor, TradeExecutor};
pub use exit_evaluator::{ExitBatchReport, ExitEvaluator, ExitMonitor};
pub use price_feed::PriceAggregator;
