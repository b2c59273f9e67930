// src/types.rs
// Core data model: candles, order blocks, pending orders, positions,
// trade history, metrics and the persisted container shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Bullish,
    Bearish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Active,
    Mitigated,
    Invalidated,
}

/// A detected order block zone. Only `Active` blocks are eligible for order
/// placement; the most recent active block per symbol wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBlock {
    pub symbol: String,
    pub block_type: BlockType,
    pub zone_top: f64,
    pub zone_bottom: f64,
    pub formation_time: DateTime<Utc>,
    pub state: BlockState,
}

impl OrderBlock {
    pub fn is_active(&self) -> bool {
        self.state == BlockState::Active
    }

    /// The zone boundary a retrace entry order sits at.
    pub fn entry_boundary(&self) -> f64 {
        match self.block_type {
            BlockType::Bullish => self.zone_top,
            BlockType::Bearish => self.zone_bottom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled)
    }
}

/// A tracked entry order the bot believes it has placed but not yet resolved.
/// Owned exclusively by the pending order tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub order_id: String,
    pub state: OrderState,
    pub remaining_quantity: f64,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn filled_quantity(&self) -> f64 {
        self.quantity - self.remaining_quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The order side that reduces/closes this position.
    pub fn close_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// An open position as reported by the exchange. `take_profit`/`stop_loss`
/// are derived each cycle from the exchange's protective orders, never
/// carried over from a pending order once a fill happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub leverage: f64,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Closed-trade ledger entry. Append-only; immutable once `Closed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    pub size: f64,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    pub status: TradeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: serde_json::Value,
}

/// Counters and gauges surfaced to the dashboard. The first two fields are
/// point-in-time gauges, the rest monotonically increasing counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub pending_orders_count: usize,
    #[serde(default)]
    pub open_exchange_orders_count: usize,
    #[serde(default)]
    pub placed_orders_count: u64,
    #[serde(default)]
    pub cancelled_orders_count: u64,
    #[serde(default)]
    pub filled_orders_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancePoint {
    pub timestamp: DateTime<Utc>,
    pub total_balance: f64,
    pub free_balance: f64,
    pub used_balance: f64,
    #[serde(default)]
    pub total_pnl: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub used: f64,
}

/// On-disk shape of pending_orders.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrdersContainer {
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub orders: HashMap<String, PendingOrder>, // symbol -> order
}

impl Default for PendingOrdersContainer {
    fn default() -> Self {
        Self {
            last_updated: Utc::now(),
            orders: HashMap::new(),
        }
    }
}
