// src/state.rs
// Explicit bot state owned by the engine loop. No ambient globals: the
// engine passes this by reference into the tracker, reconciler and store.
// The dashboard only ever sees the cloned snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::exchange::{find_tp_sl, ExchangeOrder};
use crate::orders::PendingOrderTracker;
use crate::types::{
    AccountBalance, BalancePoint, Metrics, PendingOrder, Position, PositionSide,
    ReconciliationLogEntry, TradeRecord, TradeStatus,
};

/// Display cap for the reconciliation log.
pub const MAX_RECONCILIATION_LOG_ENTRIES: usize = 50;

#[derive(Debug)]
pub struct BotState {
    pub pending: PendingOrderTracker,
    pub positions: HashMap<String, Position>,
    pub trade_history: Vec<TradeRecord>,
    pub metrics: Metrics,
    pub reconciliation_log: Vec<ReconciliationLogEntry>,
    pub balance_history: Vec<BalancePoint>,
    pub exchange_open_orders: Vec<ExchangeOrder>,
    pub balance: AccountBalance,
    pub total_pnl: f64,
    max_balance_points: usize,
}

impl BotState {
    pub fn new(max_balance_points: usize) -> Self {
        Self {
            pending: PendingOrderTracker::new(),
            positions: HashMap::new(),
            trade_history: Vec::new(),
            metrics: Metrics::default(),
            reconciliation_log: Vec::new(),
            balance_history: Vec::new(),
            exchange_open_orders: Vec::new(),
            balance: AccountBalance::default(),
            total_pnl: 0.0,
            max_balance_points,
        }
    }

    /// Append a reconciliation event; the in-memory log keeps only the most
    /// recent entries for display.
    pub fn add_reconciliation_log(&mut self, action: &str, details: serde_json::Value) {
        self.reconciliation_log.push(ReconciliationLogEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            details,
        });
        if self.reconciliation_log.len() > MAX_RECONCILIATION_LOG_ENTRIES {
            let excess = self.reconciliation_log.len() - MAX_RECONCILIATION_LOG_ENTRIES;
            self.reconciliation_log.drain(0..excess);
        }
    }

    /// Record a balance observation, trimming the series to its cap (oldest
    /// evicted first).
    pub fn update_full_balance(&mut self, total: f64, free: f64, used: f64) {
        self.balance = AccountBalance { total, free, used };
        self.balance_history.push(BalancePoint {
            timestamp: Utc::now(),
            total_balance: total,
            free_balance: free,
            used_balance: used,
            total_pnl: self.total_pnl,
        });
        if self.balance_history.len() > self.max_balance_points {
            let excess = self.balance_history.len() - self.max_balance_points;
            self.balance_history.drain(0..excess);
        }
    }

    pub fn has_open_trade(&self, symbol: &str) -> bool {
        self.trade_history
            .iter()
            .any(|t| t.symbol == symbol && t.status == TradeStatus::Open)
    }

    pub fn add_open_trade(
        &mut self,
        symbol: &str,
        side: PositionSide,
        entry_price: f64,
        size: f64,
        entry_time: Option<DateTime<Utc>>,
    ) {
        self.trade_history.push(TradeRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            exit_price: None,
            size,
            pnl: None,
            entry_time,
            exit_time: None,
            status: TradeStatus::Open,
        });
    }

    /// Close the open trade for a symbol, computing realized pnl from the
    /// exit price. Returns the pnl when a trade was actually closed.
    pub fn close_open_trade(&mut self, symbol: &str, exit_price: f64) -> Option<f64> {
        let trade = self
            .trade_history
            .iter_mut()
            .find(|t| t.symbol == symbol && t.status == TradeStatus::Open)?;
        let pnl = match trade.side {
            PositionSide::Long => (exit_price - trade.entry_price) * trade.size,
            PositionSide::Short => (trade.entry_price - exit_price) * trade.size,
        };
        trade.exit_price = Some(exit_price);
        trade.exit_time = Some(Utc::now());
        trade.pnl = Some(pnl);
        trade.status = TradeStatus::Closed;
        self.total_pnl += pnl;
        info!("Closed trade for {}: pnl {:.2}", symbol, pnl);
        Some(pnl)
    }

    /// Recompute every position's displayed TP/SL from the current exchange
    /// protective orders. Derived each cycle on purpose: caching these values
    /// across cycles reintroduces drift when a human edits orders directly.
    pub fn enrich_positions_with_tp_sl(&mut self) {
        for position in self.positions.values_mut() {
            let (sl_order, tp_order) = find_tp_sl(&self.exchange_open_orders, &position.symbol);
            position.stop_loss = sl_order.and_then(|o| o.trigger_price());
            position.take_profit = tp_order.and_then(|o| o.trigger_price());
        }
    }

    /// Refresh the point-in-time gauges.
    pub fn refresh_gauges(&mut self) {
        self.metrics.pending_orders_count = self.pending.live_count();
        self.metrics.open_exchange_orders_count = self.exchange_open_orders.len();
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let mut trade_history: Vec<TradeRecord> = self.trade_history.clone();
        trade_history.reverse(); // most recent first

        let mut pending_orders: Vec<PendingOrder> = self.pending.live_orders();
        pending_orders.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        // Exchange-sourced entry orders nothing local accounts for are still
        // part of the read surface
        let tracked_ids: Vec<String> = pending_orders.iter().map(|o| o.order_id.clone()).collect();
        let unmatched_orders: Vec<ExchangeOrder> = self
            .exchange_open_orders
            .iter()
            .filter(|o| !o.is_protective() && !tracked_ids.contains(&o.order_id))
            .cloned()
            .collect();

        let mut reconciliation_log = self.reconciliation_log.clone();
        reconciliation_log.reverse();

        StateSnapshot {
            balance: self.balance,
            total_pnl: self.total_pnl,
            positions: self.positions.values().cloned().collect(),
            pending_orders,
            unmatched_orders,
            trade_history,
            metrics: self.metrics.clone(),
            reconciliation_log,
            balance_history: self.balance_history.clone(),
        }
    }
}

/// The read-only contract consumed by the dashboard process. Plain cloned
/// data; mutating it has no effect on the bot.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub balance: AccountBalance,
    pub total_pnl: f64,
    pub positions: Vec<Position>,
    pub pending_orders: Vec<PendingOrder>,
    pub unmatched_orders: Vec<ExchangeOrder>,
    pub trade_history: Vec<TradeRecord>,
    pub metrics: Metrics,
    pub reconciliation_log: Vec<ReconciliationLogEntry>,
    pub balance_history: Vec<BalancePoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeOrderStatus, OrderType};
    use crate::types::Side;
    use serde_json::json;

    fn state() -> BotState {
        BotState::new(5000)
    }

    fn position(symbol: &str, side: PositionSide, size: f64, entry: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side,
            size,
            entry_price: entry,
            mark_price: entry,
            unrealized_pnl: 0.0,
            leverage: 1.0,
            entry_time: None,
            take_profit: None,
            stop_loss: None,
        }
    }

    fn protective(symbol: &str, order_type: OrderType, stop: f64) -> ExchangeOrder {
        ExchangeOrder {
            order_id: format!("{}-{:?}", symbol, order_type),
            symbol: symbol.to_string(),
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
    fn reconciliation_log_keeps_newest_fifty() {
        let mut state = state();
        for i in 0..60 {
            state.add_reconciliation_log("test", json!({ "i": i }));
        }
        assert_eq!(state.reconciliation_log.len(), 50);
        assert_eq!(state.reconciliation_log[0].details["i"], 10);
        assert_eq!(state.reconciliation_log[49].details["i"], 59);
    }

    #[test]
    fn balance_history_evicts_oldest_first() {
        let mut state = BotState::new(10);
        for i in 0..15 {
            state.update_full_balance(1000.0 + i as f64, 800.0, 200.0);
        }
        assert_eq!(state.balance_history.len(), 10);
        assert_eq!(state.balance_history[0].total_balance, 1005.0);
        assert_eq!(state.balance_history[9].total_balance, 1014.0);
    }

    #[test]
    fn balance_points_carry_running_pnl() {
        let mut state = state();
        state.total_pnl = 150.5;
        state.update_full_balance(2000.0, 1500.0, 500.0);
        let point = &state.balance_history[0];
        assert_eq!(point.free_balance, 1500.0);
        assert_eq!(point.used_balance, 500.0);
        assert_eq!(point.total_pnl, 150.5);
    }

    #[test]
    fn closing_a_trade_realizes_side_aware_pnl() {
        let mut state = state();
        state.add_open_trade("BTC/USDT", PositionSide::Long, 100.0, 2.0, None);
        let pnl = state.close_open_trade("BTC/USDT", 110.0).unwrap();
        assert!((pnl - 20.0).abs() < 1e-9);
        assert!((state.total_pnl - 20.0).abs() < 1e-9);

        state.add_open_trade("ETH/USDT", PositionSide::Short, 50.0, 4.0, None);
        let pnl = state.close_open_trade("ETH/USDT", 45.0).unwrap();
        assert!((pnl - 20.0).abs() < 1e-9);

        // No open trade left to close
        assert!(state.close_open_trade("BTC/USDT", 120.0).is_none());
    }

    #[test]
    fn tp_sl_is_rederived_from_exchange_orders() {
        let mut state = state();
        state.positions.insert(
            "BTC/USDT".to_string(),
            position("BTC/USDT", PositionSide::Long, 1.0, 100.0),
        );
        state.exchange_open_orders = vec![
            protective("BTC/USDT", OrderType::StopMarket, 95.0),
            protective("BTC/USDT", OrderType::TakeProfitMarket, 110.0),
        ];
        state.enrich_positions_with_tp_sl();
        let pos = &state.positions["BTC/USDT"];
        assert_eq!(pos.stop_loss, Some(95.0));
        assert_eq!(pos.take_profit, Some(110.0));

        // Orders vanished from the exchange: derived values vanish too
        state.exchange_open_orders.clear();
        state.enrich_positions_with_tp_sl();
        let pos = &state.positions["BTC/USDT"];
        assert_eq!(pos.stop_loss, None);
        assert_eq!(pos.take_profit, None);
    }

    #[test]
    fn snapshot_orders_trades_most_recent_first() {
        let mut state = state();
        state.add_open_trade("BTC/USDT", PositionSide::Long, 100.0, 1.0, None);
        state.close_open_trade("BTC/USDT", 110.0);
        state.add_open_trade("ETH/USDT", PositionSide::Long, 50.0, 1.0, None);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.trade_history[0].symbol, "ETH/USDT");
        assert_eq!(snapshot.trade_history[1].symbol, "BTC/USDT");
    }
}
