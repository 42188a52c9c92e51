use async_trait::async_trait;
use chrono::Utc;

use crate::error::EngineError;
use crate::models::{ExitDecision, Fill, Position, TradeSignal};
use crate::Result;

/// Order submission; signing and broadcast live behind this seam
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    async fn submit_entry(&self, signal: &TradeSignal) -> Result<Fill>;

    async fn submit_exit(
        &self,
        position: &Position,
        decision: &ExitDecision,
        price: f64,
    ) -> Result<Fill>;
}

/// Logs the intended order and fills it at the quoted price
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TradeExecutor for DryRunExecutor {
    async fn submit_entry(&self, signal: &TradeSignal) -> Result<Fill> {
        if !(signal.price > 0.0 && signal.suggested_size > 0.0) {
            return Err(EngineError::Execution(format!(
                "refusing entry for {}: price {} size {}",
                signal.asset.symbol, signal.price, signal.suggested_size
            )));
        }

        tracing::info!(
            "  → Would BUY {:.4} {} @ ${:.4} (total: ${:.2})",
            signal.suggested_size,
            signal.asset.symbol,
            signal.price,
            signal.suggested_size * signal.price
        );

        Ok(Fill {
            price: signal.price,
            amount: signal.suggested_size,
            timestamp: Utc::now(),
            tx_signature: None,
        })
    }

    async fn submit_exit(
        &self,
        position: &Position,
        decision: &ExitDecision,
        price: f64,
    ) -> Result<Fill> {
        if !(price > 0.0) {
            return Err(EngineError::Execution(format!(
                "refusing exit for {} at price {}",
                position.symbol, price
            )));
        }

        tracing::info!(
            "  → Would SELL {:.4} {} @ ${:.4} ({})",
            position.amount,
            position.symbol,
            price,
            decision.reason
        );

        Ok(Fill {
            price,
            amount: position.amount,
            timestamp: Utc::now(),
            tx_signature: None,
        })
    }
}
