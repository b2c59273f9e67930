// src/exchange/rest.rs
// reqwest client for the exchange bridge REST API. The raw wire structs and
// their casing variants live here; everything leaves normalized.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ExchangeGateway, ExchangeOrder, ExchangeOrderStatus, OrderType, SymbolFilters,
};
use crate::config::Config;
use crate::errors::BotError;
use crate::types::{AccountBalance, Candle, Position, PositionSide, Side};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RestGateway {
    base_url: String,
    api_key: String,
    api_secret: String,
    http_client: reqwest::Client,
}

// --- Raw wire shapes -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawBalance {
    #[serde(default, alias = "totalBalance")]
    total: f64,
    #[serde(default, alias = "freeBalance", alias = "availableBalance")]
    free: f64,
    #[serde(default, alias = "usedBalance")]
    used: f64,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    #[serde(alias = "orderId")]
    id: serde_json::Value,
    symbol: String,
    #[serde(default)]
    side: Option<String>,
    #[serde(default, rename = "type", alias = "orderType")]
    order_type: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default, alias = "stopPrice", alias = "triggerPrice")]
    stop_price: Option<f64>,
    #[serde(default, alias = "origQty", alias = "quantity")]
    amount: Option<f64>,
    #[serde(default, alias = "executedQty", alias = "filledQty")]
    filled: Option<f64>,
    #[serde(default, alias = "avgPrice", alias = "averagePrice")]
    average: Option<f64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "reduceOnly")]
    reduce_only: Option<bool>,
    #[serde(default, alias = "updateTime", alias = "time")]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    #[serde(default, alias = "positionAmt", alias = "contracts")]
    amount: Option<f64>,
    #[serde(default, alias = "entryPrice")]
    entry_price: Option<f64>,
    #[serde(default, alias = "markPrice")]
    mark_price: Option<f64>,
    #[serde(default, alias = "unrealizedPnl", alias = "unRealizedProfit")]
    unrealized_pnl: Option<f64>,
    #[serde(default)]
    leverage: Option<f64>,
    #[serde(default, alias = "positionSide")]
    side: Option<String>,
    #[serde(default, alias = "updateTime", alias = "entryTime")]
    entry_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    #[serde(default, alias = "tickSize", alias = "priceTick")]
    price_tick: Option<f64>,
    #[serde(default, alias = "stepSize", alias = "qtyStep")]
    qty_step: Option<f64>,
}

#[derive(Debug, Serialize)]
struct PlaceOrderRequest<'a> {
    symbol: &'a str,
    side: Side,
    #[serde(rename = "type")]
    order_type: &'a str,
    quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<f64>,
    reduce_only: bool,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, alias = "orderId")]
    order_id: Option<serde_json::Value>,
    #[serde(default, alias = "errorCode")]
    error_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelOrderRequest<'a> {
    symbol: &'a str,
    order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CancelOrderResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

// --- Normalization ---------------------------------------------------------

fn id_to_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_side(raw: Option<&str>) -> Side {
    match raw.map(|s| s.to_ascii_lowercase()) {
        Some(ref s) if s == "sell" || s == "short" => Side::Sell,
        _ => Side::Buy,
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

impl RawOrder {
    fn normalize(self) -> ExchangeOrder {
        ExchangeOrder {
            order_id: id_to_string(&self.id),
            symbol: self.symbol,
            side: parse_side(self.side.as_deref()),
            order_type: OrderType::parse(self.order_type.as_deref().unwrap_or("")),
            price: self.price,
            stop_price: self.stop_price,
            amount: self.amount.unwrap_or(0.0),
            filled: self.filled.unwrap_or(0.0),
            average: self.average,
            status: self
                .status
                .as_deref()
                .map(ExchangeOrderStatus::parse)
                .unwrap_or(ExchangeOrderStatus::Unknown),
            reduce_only: self.reduce_only.unwrap_or(false),
            timestamp: self.timestamp.and_then(millis_to_datetime),
        }
    }
}

impl RawPosition {
    /// Returns `None` for flat positions.
    fn normalize(self) -> Option<Position> {
        let amount = self.amount.unwrap_or(0.0);
        if amount == 0.0 {
            return None;
        }
        // Explicit side field first, sign of the amount as fallback
        let side = match self.side.as_deref().map(|s| s.to_ascii_uppercase()) {
            Some(ref s) if s == "LONG" => PositionSide::Long,
            Some(ref s) if s == "SHORT" => PositionSide::Short,
            _ => {
                if amount > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                }
            }
        };
        Some(Position {
            symbol: self.symbol,
            side,
            size: amount.abs(),
            entry_price: self.entry_price.unwrap_or(0.0),
            mark_price: self.mark_price.unwrap_or(0.0),
            unrealized_pnl: self.unrealized_pnl.unwrap_or(0.0),
            leverage: self.leverage.unwrap_or(1.0),
            entry_time: self.entry_time.and_then(millis_to_datetime),
            take_profit: None,
            stop_loss: None,
        })
    }
}

// --- Client ----------------------------------------------------------------

impl RestGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.bridge_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            http_client: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, BotError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .header("X-API-SECRET", &self.api_secret)
            .query(query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::Exchange(format!(
                "GET {} returned {}",
                path,
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BotError::Exchange(format!("Failed to parse {} response: {}", path, e)))
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BotError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .header("X-API-SECRET", &self.api_secret)
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::Exchange(format!(
                "POST {} returned {}",
                path,
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BotError::Exchange(format!("Failed to parse {} response: {}", path, e)))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        stop_price: Option<f64>,
        reduce_only: bool,
    ) -> Result<ExchangeOrder, BotError> {
        let request = PlaceOrderRequest {
            symbol,
            side,
            order_type,
            quantity,
            price,
            stop_price,
            reduce_only,
        };
        debug!(
            "Placing {} {} order for {}: qty={} price={:?} stop={:?}",
            side, order_type, symbol, quantity, price, stop_price
        );
        let response: PlaceOrderResponse = self.post_json("/orders", &request).await?;
        if !response.success {
            return Err(BotError::Exchange(format!(
                "Order rejected for {}: {} (code {:?})",
                symbol,
                response.message.unwrap_or_default(),
                response.error_code
            )));
        }
        let order_id = response
            .order_id
            .as_ref()
            .map(id_to_string)
            .ok_or_else(|| {
                BotError::Exchange(format!("Order response for {} missing order id", symbol))
            })?;
        Ok(ExchangeOrder {
            order_id,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::parse(order_type),
            price,
            stop_price,
            amount: quantity,
            filled: 0.0,
            average: None,
            status: ExchangeOrderStatus::Open,
            reduce_only,
            timestamp: Some(Utc::now()),
        })
    }
}

#[async_trait]
impl ExchangeGateway for RestGateway {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, BotError> {
        // ccxt-style rows: [open_time_ms, open, high, low, close, volume]
        let rows: Vec<(i64, f64, f64, f64, f64, f64)> = self
            .get_json(
                "/ohlcv",
                &[
                    ("symbol", symbol.to_string()),
                    ("timeframe", timeframe.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let candles = rows
            .into_iter()
            .filter_map(|(ts, open, high, low, close, volume)| {
                let open_time = millis_to_datetime(ts)?;
                Some(Candle {
                    open_time,
                    open,
                    high,
                    low,
                    close,
                    volume,
                })
            })
            .collect();
        Ok(candles)
    }

    async fn fetch_balance(&self) -> Result<AccountBalance, BotError> {
        let raw: RawBalance = self.get_json("/balance", &[]).await?;
        Ok(AccountBalance {
            total: raw.total,
            free: raw.free,
            used: raw.used,
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, BotError> {
        let raw: Vec<RawPosition> = self.get_json("/positions", &[]).await?;
        Ok(raw.into_iter().filter_map(RawPosition::normalize).collect())
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, BotError> {
        let mut query = Vec::new();
        if let Some(symbol) = symbol {
            query.push(("symbol", symbol.to_string()));
        }
        let raw: Vec<RawOrder> = self.get_json("/orders/open", &query).await?;
        Ok(raw.into_iter().map(RawOrder::normalize).collect())
    }

    async fn fetch_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<ExchangeOrder>, BotError> {
        let raw: Option<RawOrder> = self
            .get_json(
                "/orders/status",
                &[
                    ("symbol", symbol.to_string()),
                    ("order_id", order_id.to_string()),
                ],
            )
            .await?;
        Ok(raw.map(RawOrder::normalize))
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<ExchangeOrder, BotError> {
        self.place_order(symbol, side, "limit", quantity, Some(price), None, false)
            .await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<ExchangeOrder, BotError> {
        self.place_order(
            symbol,
            side,
            "stop_market",
            quantity,
            None,
            Some(stop_price),
            true,
        )
        .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<ExchangeOrder, BotError> {
        self.place_order(
            symbol,
            side,
            "take_profit_market",
            quantity,
            None,
            Some(stop_price),
            true,
        )
        .await
    }

    async fn place_market_close(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<ExchangeOrder, BotError> {
        self.place_order(symbol, side, "market", quantity, None, None, true)
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BotError> {
        let request = CancelOrderRequest { symbol, order_id };
        let response: CancelOrderResponse = self.post_json("/orders/cancel", &request).await?;
        if !response.success {
            return Err(BotError::Exchange(format!(
                "Cancel rejected for {} order {}: {}",
                symbol,
                order_id,
                response.message.unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, BotError> {
        match self
            .get_json::<RawMarket>("/markets", &[("symbol", symbol.to_string())])
            .await
        {
            Ok(raw) => {
                let defaults = SymbolFilters::default();
                Ok(SymbolFilters {
                    price_tick: raw.price_tick.unwrap_or(defaults.price_tick),
                    qty_step: raw.qty_step.unwrap_or(defaults.qty_step),
                })
            }
            Err(e) => {
                warn!("Market metadata missing for {}: {}, using defaults", symbol, e);
                Ok(SymbolFilters::default())
            }
        }
    }
}
