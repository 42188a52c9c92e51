use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::EngineError;
use crate::Result;

/// Tradable asset as seen by discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetDescriptor {
    pub id: String, // Token mint / account id
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub total_supply: f64,
    pub holder_count: u64,
    pub social_score: f64,
}

impl AssetDescriptor {
    /// Minimal descriptor for watchlist entries where only identity is known
    pub fn new(id: impl Into<String>, symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        Self {
            id: id.into(),
            name: symbol.clone(),
            symbol,
            decimals: 9,
            total_supply: 0.0,
            holder_count: 0,
            social_score: 0.0,
        }
    }

    /// Reject descriptors that would poison downstream math
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidMetric(
                "asset id must not be empty".to_string(),
            ));
        }
        if !self.total_supply.is_finite() || self.total_supply < 0.0 {
            return Err(EngineError::InvalidMetric(format!(
                "{}: total supply {} is invalid",
                self.symbol, self.total_supply
            )));
        }
        if !self.social_score.is_finite() {
            return Err(EngineError::InvalidMetric(format!(
                "{}: social score is not finite",
                self.symbol
            )));
        }
        Ok(())
    }
}

/// Price quote provider tag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Jupiter,
    Birdeye,
    DexScreener,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Jupiter => "jupiter",
            PriceSource::Birdeye => "birdeye",
            PriceSource::DexScreener => "dexscreener",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceQuote {
    pub price: f64,
    pub source: PriceSource,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64, // 0.0 - 1.0
}

impl PriceQuote {
    /// A quote is usable when price is positive and confidence is in (0, 1]
    pub fn is_usable(&self) -> bool {
        self.price.is_finite()
            && self.price > 0.0
            && self.confidence.is_finite()
            && self.confidence > 0.0
            && self.confidence <= 1.0
    }
}

/// 24h market snapshot for an asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketData {
    pub price: f64,
    pub volume_24h: f64,
    pub liquidity_usd: f64,
    pub price_change_24h: f64, // Percent
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskMetrics {
    pub volatility: f64,
    pub liquidity_depth: f64,
    pub market_cap: f64,
    pub price_feed_reliability: f64,
    pub slippage_estimate: f64,
    pub wallet_risk: f64,
    pub overall_risk: f64, // Always within [0, 1]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum TradeAction {
    Enter,
    Exit,
}

/// Sized trade recommendation, consumed once by the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub asset: AssetDescriptor,
    pub action: TradeAction,
    pub confidence: f64,
    pub price: f64,
    pub volume: f64,
    pub suggested_size: f64,
    pub risk: RiskMetrics,
    pub expected_return: f64,
    pub max_drawdown: f64,
    pub reward_to_risk: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum PositionStatus {
    Open,
    ExitRequested,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "Open",
            PositionStatus::ExitRequested => "ExitRequested",
            PositionStatus::Closed => "Closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Open" => Some(PositionStatus::Open),
            "ExitRequested" => Some(PositionStatus::ExitRequested),
            "Closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    MaxHoldingTime,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TakeProfit",
            ExitReason::StopLoss => "StopLoss",
            ExitReason::MaxHoldingTime => "MaxHoldingTime",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TakeProfit" => Some(ExitReason::TakeProfit),
            "StopLoss" => Some(ExitReason::StopLoss),
            "MaxHoldingTime" => Some(ExitReason::MaxHoldingTime),
            _ => None,
        }
    }
}

/// Position snapshot owned by the repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub asset_id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub amount: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub status: PositionStatus,
    pub realized_pnl: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

impl Position {
    /// Open a position with stop-loss/take-profit prices derived from
    /// fractional thresholds (stop loss is negative)
    pub fn open(
        asset: &AssetDescriptor,
        entry_price: f64,
        amount: f64,
        entry_time: DateTime<Utc>,
        take_profit_threshold: f64,
        stop_loss_threshold: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            asset_id: asset.id.clone(),
            symbol: asset.symbol.clone(),
            entry_price,
            amount,
            entry_time,
            stop_loss_price: entry_price * (1.0 + stop_loss_threshold),
            take_profit_price: entry_price * (1.0 + take_profit_threshold),
            status: PositionStatus::Open,
            realized_pnl: None,
            unrealized_pnl: None,
        }
    }
}

/// Fields the engine asks the repository to change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionUpdate {
    pub status: Option<PositionStatus>,
    pub realized_pnl: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub should_exit: bool,
    pub reason: String,
    pub current_pnl: f64, // Fractional, 0.05 == +5%
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "Buy",
            TradeSide::Sell => "Sell",
        }
    }
}

/// Trade execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub position_id: Uuid,
    pub asset_id: String,
    pub side: TradeSide,
    pub price: f64,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub tx_signature: Option<String>,
}

/// What the executor reports back after an order
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub tx_signature: Option<String>,
}

/// Candidate handed from discovery to the decision core
#[derive(Debug, Clone, PartialEq)]
pub enum Opportunity {
    Trending { asset: AssetDescriptor, rank: u32 },
    NewListing {
        asset: AssetDescriptor,
        listed_at: DateTime<Utc>,
    },
    Watchlist { asset: AssetDescriptor },
}

impl Opportunity {
    pub fn asset(&self) -> &AssetDescriptor {
        match self {
            Opportunity::Trending { asset, .. }
            | Opportunity::NewListing { asset, .. }
            | Opportunity::Watchlist { asset } => asset,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Opportunity::Trending { .. } => "trending",
            Opportunity::NewListing { .. } => "new_listing",
            Opportunity::Watchlist { .. } => "watchlist",
        }
    }
}
