use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use super::PositionRepository;
use crate::error::EngineError;
use crate::models::{Position, PositionStatus, PositionUpdate, Trade};
use crate::Result;

/// Postgres persistence for positions and trades
#[derive(Clone)]
pub struct PostgresPositionRepository {
    pool: PgPool,
}

impl PostgresPositionRepository {
    /// Connect to Postgres and run embedded migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    fn position_from_row(row: &sqlx::postgres::PgRow) -> Result<Position> {
        let status_str: String = row.get("status");
        let status = PositionStatus::parse(&status_str).ok_or_else(|| {
            EngineError::Repository(format!("invalid position status '{}'", status_str))
        })?;

        Ok(Position {
            id: row.get("id"),
            asset_id: row.get("asset_id"),
            symbol: row.get("symbol"),
            entry_price: row.get("entry_price"),
            amount: row.get("amount"),
            entry_time: row.get::<DateTime<Utc>, _>("entry_time"),
            stop_loss_price: row.get("stop_loss_price"),
            take_profit_price: row.get("take_profit_price"),
            status,
            realized_pnl: row.get("realized_pnl"),
            unrealized_pnl: row.get("unrealized_pnl"),
        })
    }

    /// Sum of realized P&L over closed positions
    pub async fn total_realized_pnl(&self) -> Result<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(realized_pnl), 0) AS total FROM positions WHERE status = $1",
        )
        .bind(PositionStatus::Closed.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("total"))
    }

    #[cfg(test)]
    async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM trades").execute(&self.pool).await?;
        sqlx::query("DELETE FROM positions").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PositionRepository for PostgresPositionRepository {
    async fn get_open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, asset_id, symbol, entry_price, amount, entry_time,
                   stop_loss_price, take_profit_price, status,
                   realized_pnl, unrealized_pnl
            FROM positions
            WHERE status <> $1
            ORDER BY entry_time ASC
            "#,
        )
        .bind(PositionStatus::Closed.as_str())
        .fetch_all(&self.pool)
        .await?;

        let positions = rows
            .iter()
            .map(Self::position_from_row)
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!("Loaded {} open positions from Postgres", positions.len());

        Ok(positions)
    }

    async fn open_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, asset_id, symbol, entry_price, amount, entry_time,
                stop_loss_price, take_profit_price, status,
                realized_pnl, unrealized_pnl
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(position.id)
        .bind(&position.asset_id)
        .bind(&position.symbol)
        .bind(position.entry_price)
        .bind(position.amount)
        .bind(position.entry_time)
        .bind(position.stop_loss_price)
        .bind(position.take_profit_price)
        .bind(position.status.as_str())
        .bind(position.realized_pnl)
        .bind(position.unrealized_pnl)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved position {} for {} to Postgres", position.id, position.symbol);

        Ok(())
    }

    async fn update_position(&self, id: Uuid, update: PositionUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                status = COALESCE($2, status),
                realized_pnl = COALESCE($3, realized_pnl),
                unrealized_pnl = COALESCE($4, unrealized_pnl),
                exit_price = COALESCE($5, exit_price),
                exit_time = COALESCE($6, exit_time),
                exit_reason = COALESCE($7, exit_reason),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.realized_pnl)
        .bind(update.unrealized_pnl)
        .bind(update.exit_price)
        .bind(update.exit_time)
        .bind(update.exit_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Repository(format!("position {} not found", id)));
        }

        Ok(())
    }

    async fn record_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (id, position_id, asset_id, side, price, amount, timestamp, tx_signature)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(trade.position_id)
        .bind(&trade.asset_id)
        .bind(trade.side.as_str())
        .bind(trade.price)
        .bind(trade.amount)
        .bind(trade.timestamp)
        .bind(&trade.tx_signature)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Recorded {} trade for position {}",
            trade.side.as_str(),
            trade.position_id
        );

        Ok(())
    }
}
