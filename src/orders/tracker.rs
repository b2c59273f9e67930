// src/orders/tracker.rs
// Authoritative local record of entry orders placed but not yet resolved.
// One live order per symbol; every mutation goes through these methods so
// the reconciler can issue commands without touching fields directly.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::types::{OrderState, PendingOrder, PendingOrdersContainer};

#[derive(Debug, Default)]
pub struct PendingOrderTracker {
    orders: HashMap<String, PendingOrder>, // symbol -> order
}

impl PendingOrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_container(container: PendingOrdersContainer) -> Self {
        Self {
            orders: container.orders,
        }
    }

    /// Snapshot for persistence.
    pub fn to_container(&self) -> PendingOrdersContainer {
        PendingOrdersContainer {
            last_updated: Utc::now(),
            orders: self.orders.clone(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&PendingOrder> {
        self.orders.get(symbol)
    }

    /// True when a NEW or PARTIALLY_FILLED order exists for the symbol.
    pub fn has_live(&self, symbol: &str) -> bool {
        self.orders.get(symbol).map_or(false, |o| o.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.orders.values().filter(|o| o.is_live()).count()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.orders.keys().cloned().collect()
    }

    pub fn live_orders(&self) -> Vec<PendingOrder> {
        self.orders.values().filter(|o| o.is_live()).cloned().collect()
    }

    /// Register a freshly placed entry order. Replacing a live order for the
    /// same symbol is a bug upstream and is refused.
    pub fn track(&mut self, order: PendingOrder) -> bool {
        if self.has_live(&order.symbol) {
            warn!(
                "Refusing to track second live order for {} ({})",
                order.symbol, order.order_id
            );
            return false;
        }
        info!(
            "Tracking {} {} order {} @ {} (qty {})",
            order.symbol, order.side, order.order_id, order.entry_price, order.quantity
        );
        self.orders.insert(order.symbol.clone(), order);
        true
    }

    /// Adopt an exchange order discovered during reconciliation that matches
    /// an active block. TP/SL are recovered later from protective orders.
    pub fn adopt(
        &mut self,
        symbol: &str,
        order_id: &str,
        side: crate::types::Side,
        entry_price: f64,
        quantity: f64,
        created_at: Option<DateTime<Utc>>,
    ) -> bool {
        self.track(PendingOrder {
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            take_profit: 0.0,
            stop_loss: 0.0,
            order_id: order_id.to_string(),
            state: OrderState::New,
            remaining_quantity: quantity,
            created_at: created_at.unwrap_or_else(Utc::now),
        })
    }

    /// Apply a partial fill observation. Returns the quantity newly filled
    /// since the last observation (protective orders are sized to it).
    pub fn record_partial_fill(&mut self, symbol: &str, filled: f64) -> Option<f64> {
        let order = self.orders.get_mut(symbol)?;
        let previously_filled = order.quantity - order.remaining_quantity;
        let newly_filled = filled - previously_filled;
        if newly_filled <= 0.0 {
            return Some(0.0);
        }
        order.state = OrderState::PartiallyFilled;
        order.remaining_quantity = order.quantity - filled;
        info!(
            "Partial fill for {}: {}/{} filled, {} remaining",
            symbol, filled, order.quantity, order.remaining_quantity
        );
        Some(newly_filled)
    }

    /// Complete fill: removes the order and returns it along with the
    /// portion that still lacked protective orders.
    pub fn mark_filled(&mut self, symbol: &str) -> Option<(PendingOrder, f64)> {
        let mut order = self.orders.remove(symbol)?;
        let unprotected = order.remaining_quantity;
        order.state = OrderState::Filled;
        order.remaining_quantity = 0.0;
        info!("Order {} for {} fully filled", order.order_id, symbol);
        Some((order, unprotected))
    }

    /// Exchange-side cancellation (or expiry/rejection): removes the order.
    pub fn mark_cancelled(&mut self, symbol: &str) -> Option<PendingOrder> {
        let mut order = self.orders.remove(symbol)?;
        order.state = OrderState::Cancelled;
        info!("Order {} for {} cancelled", order.order_id, symbol);
        Some(order)
    }

    /// Drop a tracked order without a state transition (startup cleanup of
    /// entries the exchange no longer knows).
    pub fn remove(&mut self, symbol: &str) -> Option<PendingOrder> {
        self.orders.remove(symbol)
    }

    /// Symbols whose untouched NEW order has been resting longer than
    /// `stale_secs` and should be cancelled and re-placed.
    pub fn stale_symbols(&self, now: DateTime<Utc>, stale_secs: i64) -> Vec<String> {
        self.orders
            .values()
            .filter(|o| {
                o.state == OrderState::New
                    && o.filled_quantity() == 0.0
                    && (now - o.created_at).num_seconds() > stale_secs
            })
            .map(|o| o.symbol.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::Duration;

    fn order(symbol: &str, quantity: f64) -> PendingOrder {
        PendingOrder {
            symbol: symbol.to_string(),
            side: Side::Buy,
            entry_price: 100.0,
            quantity,
            take_profit: 110.0,
            stop_loss: 95.0,
            order_id: format!("oid-{}", symbol),
            state: OrderState::New,
            remaining_quantity: quantity,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn refuses_second_live_order_per_symbol() {
        let mut tracker = PendingOrderTracker::new();
        assert!(tracker.track(order("BTC/USDT", 1.0)));
        assert!(!tracker.track(order("BTC/USDT", 2.0)));
        assert_eq!(tracker.live_count(), 1);
        assert_eq!(tracker.get("BTC/USDT").unwrap().quantity, 1.0);
    }

    #[test]
    fn partial_fill_updates_remaining_and_reports_delta() {
        let mut tracker = PendingOrderTracker::new();
        tracker.track(order("BTC/USDT", 10.0));

        let newly = tracker.record_partial_fill("BTC/USDT", 4.0).unwrap();
        assert!((newly - 4.0).abs() < 1e-9);
        let tracked = tracker.get("BTC/USDT").unwrap();
        assert_eq!(tracked.state, OrderState::PartiallyFilled);
        assert!((tracked.remaining_quantity - 6.0).abs() < 1e-9);

        // Repeat observation with no growth places nothing new
        let newly = tracker.record_partial_fill("BTC/USDT", 4.0).unwrap();
        assert_eq!(newly, 0.0);

        // Growth reports only the delta
        let newly = tracker.record_partial_fill("BTC/USDT", 7.0).unwrap();
        assert!((newly - 3.0).abs() < 1e-9);
        assert!((tracker.get("BTC/USDT").unwrap().remaining_quantity - 3.0).abs() < 1e-9);
    }

    #[test]
    fn full_fill_reports_unprotected_portion() {
        let mut tracker = PendingOrderTracker::new();
        tracker.track(order("BTC/USDT", 10.0));
        tracker.record_partial_fill("BTC/USDT", 4.0);

        let (filled, unprotected) = tracker.mark_filled("BTC/USDT").unwrap();
        assert_eq!(filled.state, OrderState::Filled);
        assert!((unprotected - 6.0).abs() < 1e-9);
        assert!(!tracker.has_live("BTC/USDT"));
    }

    #[test]
    fn cancelled_orders_leave_the_pending_set() {
        let mut tracker = PendingOrderTracker::new();
        tracker.track(order("BTC/USDT", 1.0));
        let cancelled = tracker.mark_cancelled("BTC/USDT").unwrap();
        assert_eq!(cancelled.state, OrderState::Cancelled);
        assert_eq!(tracker.live_count(), 0);
        // A replacement may now be tracked
        assert!(tracker.track(order("BTC/USDT", 1.0)));
    }

    #[test]
    fn stale_detection_only_touches_unfilled_new_orders() {
        let mut tracker = PendingOrderTracker::new();
        let mut old = order("BTC/USDT", 1.0);
        old.created_at = Utc::now() - Duration::seconds(1000);
        tracker.track(old);

        let mut partial = order("ETH/USDT", 10.0);
        partial.created_at = Utc::now() - Duration::seconds(1000);
        tracker.track(partial);
        tracker.record_partial_fill("ETH/USDT", 2.0);

        tracker.track(order("SOL/USDT", 1.0));

        let stale = tracker.stale_symbols(Utc::now(), 900);
        assert_eq!(stale, vec!["BTC/USDT".to_string()]);
    }
}
