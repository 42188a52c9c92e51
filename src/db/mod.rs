// Position storage
pub mod postgres;

pub use postgres::PostgresPositionRepository;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Position, PositionStatus, PositionUpdate, Trade};
use crate::Result;

/// Owner of position state; the engine only reads snapshots
#[async_trait]
pub trait PositionRepository: Send + Sync {
    /// Every position not yet `Closed`
    async fn get_open_positions(&self) -> Result<Vec<Position>>;

    async fn open_position(&self, position: &Position) -> Result<()>;

    async fn update_position(&self, id: Uuid, update: PositionUpdate) -> Result<()>;

    async fn record_trade(&self, trade: &Trade) -> Result<()>;
}

/// Process-local repository for dry runs without a database
#[derive(Default)]
pub struct InMemoryPositionRepository {
    positions: RwLock<HashMap<Uuid, Position>>,
    trades: RwLock<Vec<Trade>>,
}

impl InMemoryPositionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: Uuid) -> Option<Position> {
        self.positions.read().await.get(&id).cloned()
    }

    pub async fn trades(&self) -> Vec<Trade> {
        self.trades.read().await.clone()
    }
}

#[async_trait]
impl PositionRepository for InMemoryPositionRepository {
    async fn get_open_positions(&self) -> Result<Vec<Position>> {
        let mut open: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .cloned()
            .collect();
        open.sort_by_key(|p| p.entry_time);
        Ok(open)
    }

    async fn open_position(&self, position: &Position) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(position.id, position.clone());
        Ok(())
    }

    async fn update_position(&self, id: Uuid, update: PositionUpdate) -> Result<()> {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&id)
            .ok_or_else(|| EngineError::Repository(format!("position {} not found", id)))?;

        if let Some(status) = update.status {
            position.status = status;
        }
        if update.realized_pnl.is_some() {
            position.realized_pnl = update.realized_pnl;
        }
        if update.unrealized_pnl.is_some() {
            position.unrealized_pnl = update.unrealized_pnl;
        }
        Ok(())
    }

    async fn record_trade(&self, trade: &Trade) -> Result<()> {
        self.trades.write().await.push(trade.clone());
        Ok(())
    }
}
