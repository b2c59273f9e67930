// src/exchange/mod.rs
// Exchange gateway trait and the canonical order/position shapes every
// internal component consumes. Field-name variance from the exchange is
// normalized here and nowhere else.

pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BotError;
use crate::types::{AccountBalance, Candle, Position, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
    Other,
}

impl OrderType {
    pub fn parse(raw: &str) -> OrderType {
        match raw.to_ascii_lowercase().as_str() {
            "limit" => OrderType::Limit,
            "market" => OrderType::Market,
            "stop_market" | "stop" | "stop_loss" => OrderType::StopMarket,
            "take_profit_market" | "take_profit" => OrderType::TakeProfitMarket,
            _ => OrderType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    Open,
    Filled,
    Cancelled,
    Expired,
    Rejected,
    Unknown,
}

impl ExchangeOrderStatus {
    pub fn parse(raw: &str) -> ExchangeOrderStatus {
        match raw.to_ascii_lowercase().as_str() {
            "open" | "new" | "partially_filled" => ExchangeOrderStatus::Open,
            "filled" | "closed" => ExchangeOrderStatus::Filled,
            "canceled" | "cancelled" => ExchangeOrderStatus::Cancelled,
            "expired" => ExchangeOrderStatus::Expired,
            "rejected" => ExchangeOrderStatus::Rejected,
            _ => ExchangeOrderStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeOrderStatus::Filled
                | ExchangeOrderStatus::Cancelled
                | ExchangeOrderStatus::Expired
                | ExchangeOrderStatus::Rejected
        )
    }
}

/// Canonical open-order shape. All internal logic consumes this and only
/// this; the raw wire formats stay inside the rest client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    pub amount: f64,
    #[serde(default)]
    pub filled: f64,
    #[serde(default)]
    pub average: Option<f64>,
    pub status: ExchangeOrderStatus,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ExchangeOrder {
    /// Protective orders (TP/SL) are reduce-only or one of the conditional
    /// market types; everything else is an entry order.
    pub fn is_protective(&self) -> bool {
        self.reduce_only
            || matches!(
                self.order_type,
                OrderType::StopMarket | OrderType::TakeProfitMarket
            )
    }

    /// The price a protective order triggers at, preferring the stop price
    /// over the (usually absent) limit price.
    pub fn trigger_price(&self) -> Option<f64> {
        self.stop_price.or(self.price)
    }
}

/// Pick the stop-loss and take-profit orders covering a symbol out of an
/// open-order list.
pub fn find_tp_sl<'a>(
    orders: &'a [ExchangeOrder],
    symbol: &str,
) -> (Option<&'a ExchangeOrder>, Option<&'a ExchangeOrder>) {
    let mut sl_order = None;
    let mut tp_order = None;
    for order in orders.iter().filter(|o| o.symbol == symbol) {
        match order.order_type {
            OrderType::StopMarket => sl_order = Some(order),
            OrderType::TakeProfitMarket => tp_order = Some(order),
            _ => {}
        }
    }
    (sl_order, tp_order)
}

/// Per-symbol precision rules from market metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub price_tick: f64,
    pub qty_step: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        // Fallback when market metadata is missing
        Self {
            price_tick: 1e-8,
            qty_step: 1e-8,
        }
    }
}

/// Capability set the bot consumes from the exchange connectivity layer.
/// Implemented by the REST bridge client in production and by scripted mocks
/// in tests.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, BotError>;

    async fn fetch_balance(&self) -> Result<AccountBalance, BotError>;

    /// Open positions only; zero-size entries are filtered out.
    async fn fetch_positions(&self) -> Result<Vec<Position>, BotError>;

    async fn fetch_open_orders(&self, symbol: Option<&str>)
        -> Result<Vec<ExchangeOrder>, BotError>;

    /// Status lookup for a single order; `None` when the exchange no longer
    /// knows the id.
    async fn fetch_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<ExchangeOrder>, BotError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<ExchangeOrder, BotError>;

    /// Reduce-only STOP_MARKET order protecting an open position.
    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<ExchangeOrder, BotError>;

    /// Reduce-only TAKE_PROFIT_MARKET order protecting an open position.
    async fn place_take_profit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<ExchangeOrder, BotError>;

    /// Reduce-only market order that closes (part of) a position right now.
    async fn place_market_close(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<ExchangeOrder, BotError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BotError>;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, BotError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protective(order_type: OrderType, stop: f64) -> ExchangeOrder {
        ExchangeOrder {
            order_id: "1".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: Side::Sell,
            order_type,
            price: None,
            stop_price: Some(stop),
            amount: 1.0,
            filled: 0.0,
            average: None,
            status: ExchangeOrderStatus::Open,
            reduce_only: true,
            timestamp: None,
        }
    }

    #[test]
    fn classifies_protective_orders() {
        assert!(protective(OrderType::StopMarket, 1.0).is_protective());
        assert!(protective(OrderType::TakeProfitMarket, 1.0).is_protective());

        let mut entry = protective(OrderType::Limit, 1.0);
        entry.reduce_only = false;
        assert!(!entry.is_protective());
    }

    #[test]
    fn finds_tp_sl_pair_for_symbol() {
        let orders = vec![
            protective(OrderType::StopMarket, 95.0),
            protective(OrderType::TakeProfitMarket, 110.0),
        ];
        let (sl, tp) = find_tp_sl(&orders, "BTC/USDT");
        assert_eq!(sl.unwrap().stop_price, Some(95.0));
        assert_eq!(tp.unwrap().stop_price, Some(110.0));

        let (sl, tp) = find_tp_sl(&orders, "ETH/USDT");
        assert!(sl.is_none() && tp.is_none());
    }

    #[test]
    fn parses_status_casing_variants() {
        assert_eq!(
            ExchangeOrderStatus::parse("CANCELED"),
            ExchangeOrderStatus::Cancelled
        );
        assert_eq!(
            ExchangeOrderStatus::parse("cancelled"),
            ExchangeOrderStatus::Cancelled
        );
        assert_eq!(ExchangeOrderStatus::parse("NEW"), ExchangeOrderStatus::Open);
        assert_eq!(
            ExchangeOrderStatus::parse("weird"),
            ExchangeOrderStatus::Unknown
        );
    }

    #[test]
    fn parses_order_type_variants() {
        assert_eq!(OrderType::parse("STOP_MARKET"), OrderType::StopMarket);
        assert_eq!(
            OrderType::parse("take_profit_market"),
            OrderType::TakeProfitMarket
        );
        assert_eq!(OrderType::parse("LIMIT"), OrderType::Limit);
    }
}
