// src/engine.rs
// Single-loop scheduler: one cycle fetches balance, orders and positions,
// polls pending entry orders, and then scans each symbol for a tradeable
// order block. A slower time-gated pass re-runs TP/SL reconciliation. A
// failure for one symbol never blocks the others.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::BotError;
use crate::exchange::{ExchangeGateway, ExchangeOrder};
use crate::orders::tracker::PendingOrderTracker;
use crate::persistence::Store;
use crate::reconcile;
use crate::risk::{size_order, RiskConfig};
use crate::state::BotState;
use crate::types::{OrderState, PendingOrder, PositionSide, Side};
use crate::zones::detector::latest_active_block;
use crate::zones::{detect_order_blocks, DetectorConfig};

pub struct Engine<G: ExchangeGateway> {
    gateway: G,
    store: Store,
    config: Config,
    pub state: BotState,
    last_reconciliation: Option<Instant>,
}

impl<G: ExchangeGateway> Engine<G> {
    pub fn new(gateway: G, store: Store, config: Config) -> Self {
        let state = BotState::new(config.max_balance_points);
        Self {
            gateway,
            store,
            config,
            state,
            last_reconciliation: None,
        }
    }

    fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            pivot_length: self.config.pivot_length,
        }
    }

    fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            risk_per_trade: self.config.risk_per_trade,
            reward_ratio: self.config.reward_ratio,
        }
    }

    /// Load persisted snapshots and run the startup reconciliation sequence.
    pub async fn startup(&mut self) {
        let pending = self.store.load_pending_orders().await;
        if !pending.orders.is_empty() {
            info!("Loaded {} pending orders from disk", pending.orders.len());
        }
        self.state.pending = PendingOrderTracker::from_container(pending);
        self.state.metrics = self.store.load_metrics().await;
        self.state.trade_history = self.store.load_trade_history().await;
        self.state.balance_history = self.store.load_balance_history().await;
        self.state.total_pnl = self
            .state
            .trade_history
            .iter()
            .filter_map(|t| t.pnl)
            .sum();

        reconcile::reconcile_live_orders(&self.gateway, &mut self.state, &self.store, &self.config)
            .await;
        reconcile::reconcile_all_positions_tp_sl(
            &self.gateway,
            &mut self.state,
            &self.store,
            &self.config,
        )
        .await;
        reconcile::reconcile_positions_with_trades(&self.gateway, &mut self.state, &self.store)
            .await;
        self.last_reconciliation = Some(Instant::now());
    }

    /// Run forever. A cycle either completes or is abandoned and retried at
    /// the next tick; there is no mid-cycle restart.
    pub async fn run(&mut self) {
        self.startup().await;
        loop {
            self.run_cycle().await;
            tokio::time::sleep(Duration::from_secs(self.config.cycle_secs)).await;
        }
    }

    pub async fn run_cycle(&mut self) {
        // Slow-cadence TP/SL reconciliation inside the same loop
        let due = self
            .last_reconciliation
            .map_or(true, |t| t.elapsed().as_secs() >= self.config.reconcile_interval_secs);
        if due {
            info!("--- Periodic position reconciliation ---");
            reconcile::reconcile_all_positions_tp_sl(
                &self.gateway,
                &mut self.state,
                &self.store,
                &self.config,
            )
            .await;
            self.last_reconciliation = Some(Instant::now());
        }

        self.poll_pending_orders().await;

        match self.gateway.fetch_balance().await {
            Ok(balance) => {
                self.state
                    .update_full_balance(balance.total, balance.free, balance.used);
                self.store
                    .save_balance_history(&self.state.balance_history)
                    .await;
            }
            Err(e) => warn!("Error fetching balance: {}", e),
        }

        self.state.exchange_open_orders = self.fetch_all_open_orders().await;
        self.sync_positions().await;
        self.state.enrich_positions_with_tp_sl();
        self.state.refresh_gauges();

        if self.config.active_tp_sl_monitoring {
            self.monitor_and_close_positions().await;
        }

        let mut placed_this_cycle: HashSet<String> = HashSet::new();
        for symbol in self.config.trading_pairs.clone() {
            if let Err(e) = self.process_symbol(&symbol, &mut placed_this_cycle).await {
                match e {
                    BotError::Data(msg) => {
                        warn!("Skipping {} for this cycle: {}", symbol, msg)
                    }
                    other => error!("Error processing {}: {}", symbol, other),
                }
            }
        }

        self.state.refresh_gauges();
    }

    async fn fetch_all_open_orders(&self) -> Vec<ExchangeOrder> {
        let mut all_orders = Vec::new();
        for symbol in &self.config.trading_pairs {
            match self.gateway.fetch_open_orders(Some(symbol)).await {
                Ok(orders) => all_orders.extend(orders),
                Err(e) => warn!("Error fetching open orders for {}: {}", symbol, e),
            }
        }
        all_orders
    }

    /// Advance the pending order state machine from exchange-reported order
    /// status: fills place protective orders, cancellations free the symbol
    /// for a replacement later in the same cycle.
    pub async fn poll_pending_orders(&mut self) {
        for symbol in self.state.pending.symbols() {
            let Some(pending) = self.state.pending.get(&symbol).cloned() else {
                continue;
            };
            if !pending.is_live() {
                continue;
            }
            let order = match self.gateway.fetch_order(&symbol, &pending.order_id).await {
                Ok(Some(order)) => order,
                Ok(None) => continue, // resolved by the next startup pass
                Err(e) => {
                    warn!("Could not check order {} for {}: {}", pending.order_id, symbol, e);
                    continue;
                }
            };

            use crate::exchange::ExchangeOrderStatus::*;
            let filled = order.filled;
            match order.status {
                Filled => self.handle_fill(&symbol, &pending, &order).await,
                Cancelled | Expired | Rejected => {
                    info!(
                        "Entry order {} for {} is {:?}, removing from pending",
                        pending.order_id, symbol, order.status
                    );
                    if order.status == Cancelled {
                        self.state.metrics.cancelled_orders_count += 1;
                    }
                    self.state.pending.mark_cancelled(&symbol);
                    self.state.add_reconciliation_log(
                        "pending_order_removed",
                        serde_json::json!({
                            "symbol": symbol,
                            "order_id": pending.order_id,
                            "status": format!("{:?}", order.status),
                            "message": "Entry order no longer active, removed from tracking",
                        }),
                    );
                    self.store
                        .save_pending_orders(&self.state.pending.to_container())
                        .await;
                    self.store.save_metrics(&self.state.metrics).await;
                }
                _ if filled > 0.0 && filled < pending.quantity => {
                    self.handle_partial_fill(&symbol, &pending, filled).await;
                }
                _ if filled == 0.0 => {
                    // Untouched resting order; cancel and free the slot once
                    // it has gone stale
                    let age = (Utc::now() - pending.created_at).num_seconds();
                    if age > self.config.pending_stale_secs {
                        info!(
                            "Pending order {} for {} stale ({}s), cancelling for re-placement",
                            pending.order_id, symbol, age
                        );
                        if let Err(e) =
                            self.gateway.cancel_order(&symbol, &pending.order_id).await
                        {
                            warn!("Failed to cancel stale order for {}: {}", symbol, e);
                            continue;
                        }
                        self.state.pending.remove(&symbol);
                        self.store
                            .save_pending_orders(&self.state.pending.to_container())
                            .await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn handle_partial_fill(&mut self, symbol: &str, pending: &PendingOrder, filled: f64) {
        let Some(newly_filled) = self.state.pending.record_partial_fill(symbol, filled) else {
            return;
        };
        if newly_filled > 0.0 {
            self.place_protective_orders(pending, newly_filled).await;
        }
        self.store
            .save_pending_orders(&self.state.pending.to_container())
            .await;
    }

    async fn handle_fill(&mut self, symbol: &str, pending: &PendingOrder, order: &ExchangeOrder) {
        info!("Entry order filled for {}, placing protective orders", symbol);
        let Some((_, unprotected)) = self.state.pending.mark_filled(symbol) else {
            return;
        };
        if unprotected > 0.0 {
            self.place_protective_orders(pending, unprotected).await;
        }

        // Actual average fill price when the exchange reports one
        let fill_price = order
            .average
            .or(order.price)
            .unwrap_or(pending.entry_price);
        let side = match pending.side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        };
        self.state.add_open_trade(
            symbol,
            side,
            fill_price,
            pending.quantity,
            order.timestamp.or(Some(Utc::now())),
        );
        self.state.metrics.filled_orders_count += 1;

        self.store
            .save_pending_orders(&self.state.pending.to_container())
            .await;
        self.store.save_metrics(&self.state.metrics).await;
        self.store.save_trade_history(&self.state.trade_history).await;
    }

    /// TP/SL sized to exactly the newly filled portion. Placement failures
    /// are warnings: the periodic reconciliation pass repairs missing
    /// protective orders on its next run.
    async fn place_protective_orders(&mut self, pending: &PendingOrder, quantity: f64) {
        let close_side = pending.side.opposite();
        if let Err(e) = self
            .gateway
            .place_stop_loss(&pending.symbol, close_side, quantity, pending.stop_loss)
            .await
        {
            warn!("Failed to place SL for {}: {}", pending.symbol, e);
        }
        if let Err(e) = self
            .gateway
            .place_take_profit(&pending.symbol, close_side, quantity, pending.take_profit)
            .await
        {
            warn!("Failed to place TP for {}: {}", pending.symbol, e);
        }
    }

    /// Safety net over the exchange's conditional orders: when the mark
    /// price has breached a position's derived TP/SL but the protective
    /// order did not trigger (missing, cancelled, or stuck), close the
    /// position with a reduce-only market order.
    async fn monitor_and_close_positions(&mut self) {
        let positions: Vec<_> = self.state.positions.values().cloned().collect();
        for position in positions {
            let symbol = position.symbol.clone();
            if position.size <= 0.0 || position.mark_price <= 0.0 {
                continue;
            }
            let (take_profit, stop_loss) = (position.take_profit, position.stop_loss);
            if take_profit.is_none() && stop_loss.is_none() {
                continue;
            }

            let is_long = position.side == PositionSide::Long;
            // TP/SL on the wrong side of entry means the derived values are
            // bogus; closing on them would realize a phantom breach
            let inconsistent = if is_long {
                take_profit.is_some_and(|tp| tp <= position.entry_price)
                    || stop_loss.is_some_and(|sl| sl >= position.entry_price)
            } else {
                take_profit.is_some_and(|tp| tp >= position.entry_price)
                    || stop_loss.is_some_and(|sl| sl <= position.entry_price)
            };
            if inconsistent {
                warn!(
                    "⚠ Skipping closure for {}: TP/SL inconsistent for {} (entry {}, TP {:?}, SL {:?})",
                    symbol, position.side, position.entry_price, take_profit, stop_loss
                );
                continue;
            }

            let mark = position.mark_price;
            let breach = if is_long {
                if take_profit.is_some_and(|tp| mark >= tp) {
                    Some("tp_breach")
                } else if stop_loss.is_some_and(|sl| mark <= sl) {
                    Some("sl_breach")
                } else {
                    None
                }
            } else if take_profit.is_some_and(|tp| mark <= tp) {
                Some("tp_breach")
            } else if stop_loss.is_some_and(|sl| mark >= sl) {
                Some("sl_breach")
            } else {
                None
            };
            let Some(reason) = breach else { continue };

            warn!(
                "⚠ Breach detected for {}: {} at mark {} (entry {}, TP {:?}, SL {:?})",
                symbol, reason, mark, position.entry_price, take_profit, stop_loss
            );

            // Cancel the leftover protective pair first so the market close
            // cannot race a late trigger
            let protective_ids: Vec<String> = self
                .state
                .exchange_open_orders
                .iter()
                .filter(|o| o.symbol == symbol && o.is_protective())
                .map(|o| o.order_id.clone())
                .collect();
            for order_id in protective_ids {
                if let Err(e) = self.gateway.cancel_order(&symbol, &order_id).await {
                    warn!("Failed to cancel protective order {} for {}: {}", order_id, symbol, e);
                }
            }

            let close_side = position.side.close_side();
            match self
                .gateway
                .place_market_close(&symbol, close_side, position.size)
                .await
            {
                Ok(order) => {
                    let pnl = if is_long {
                        (mark - position.entry_price) * position.size
                    } else {
                        (position.entry_price - mark) * position.size
                    };
                    info!(
                        "⚠ Forced closure ({}) for {}: {} {} at market, est. pnl {:.2}",
                        reason, symbol, close_side, position.size, pnl
                    );
                    self.state.add_reconciliation_log(
                        "forced_closure",
                        serde_json::json!({
                            "symbol": symbol,
                            "reason": reason,
                            "side": position.side.to_string(),
                            "size": position.size,
                            "entry_price": position.entry_price,
                            "mark_price": mark,
                            "pnl": pnl,
                            "market_order_id": order.order_id,
                        }),
                    );
                }
                Err(e) => {
                    warn!("Failed to close position for {}: {}", symbol, e);
                    self.state.add_reconciliation_log(
                        "forced_closure_failed",
                        serde_json::json!({
                            "symbol": symbol,
                            "reason": reason,
                            "message": "Market order failed to execute",
                        }),
                    );
                }
            }
        }
    }

    /// Refresh positions from the exchange and close out the ledger entry of
    /// any position that disappeared since the last cycle.
    async fn sync_positions(&mut self) {
        let positions = match self.gateway.fetch_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!("Error fetching positions: {}", e);
                return;
            }
        };

        let mut closed_any = false;
        let current_symbols: HashSet<String> =
            positions.iter().map(|p| p.symbol.clone()).collect();
        let gone: Vec<(String, f64)> = self
            .state
            .positions
            .iter()
            .filter(|(symbol, _)| !current_symbols.contains(*symbol))
            .map(|(symbol, position)| (symbol.clone(), position.mark_price))
            .collect();
        for (symbol, mark_price) in gone {
            if self.state.close_open_trade(&symbol, mark_price).is_some() {
                closed_any = true;
            }
        }

        self.state.positions = positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        if closed_any {
            self.store.save_trade_history(&self.state.trade_history).await;
        }
    }

    /// Detect, size and place for one symbol. At most one placement per
    /// symbol per cycle, and never while a position or live entry order
    /// exists.
    async fn process_symbol(
        &mut self,
        symbol: &str,
        placed_this_cycle: &mut HashSet<String>,
    ) -> Result<(), BotError> {
        let candles = self
            .gateway
            .fetch_ohlcv(symbol, &self.config.timeframe, self.config.candle_limit)
            .await?;
        if candles.is_empty() {
            return Ok(());
        }

        let blocks = detect_order_blocks(symbol, &candles, &self.detector_config())?;
        let Some(block) = latest_active_block(&blocks) else {
            return Ok(());
        };

        if self.state.positions.contains_key(symbol)
            || self.state.pending.has_live(symbol)
            || placed_this_cycle.contains(symbol)
        {
            return Ok(());
        }

        let current_price = candles.last().map(|c| c.close).unwrap_or(0.0);
        let filters = self.gateway.symbol_filters(symbol).await?;
        let equity = self.state.balance.free;
        let Some(spec) = size_order(block, equity, current_price, &filters, &self.risk_config())
        else {
            return Ok(());
        };

        // Clear stray entry orders for the symbol so the new limit order is
        // the only one working
        let leftovers: Vec<String> = self
            .state
            .exchange_open_orders
            .iter()
            .filter(|o| o.symbol == symbol && !o.is_protective())
            .map(|o| o.order_id.clone())
            .collect();
        for order_id in leftovers {
            if let Err(e) = self.gateway.cancel_order(symbol, &order_id).await {
                warn!("Failed to cancel stray order {} for {}: {}", order_id, symbol, e);
            }
        }

        info!(
            "Placing order: {} {} {} @ {}",
            spec.side, spec.quantity, symbol, spec.entry_price
        );
        let placed = self
            .gateway
            .place_limit_order(symbol, spec.side, spec.quantity, spec.entry_price)
            .await?;
        info!("Order placed, id {}", placed.order_id);

        self.state.pending.track(PendingOrder {
            symbol: symbol.to_string(),
            side: spec.side,
            entry_price: spec.entry_price,
            quantity: spec.quantity,
            take_profit: spec.take_profit,
            stop_loss: spec.stop_loss,
            order_id: placed.order_id,
            state: OrderState::New,
            remaining_quantity: spec.quantity,
            created_at: Utc::now(),
        });
        self.state.metrics.placed_orders_count += 1;
        placed_this_cycle.insert(symbol.to_string());

        self.store
            .save_pending_orders(&self.state.pending.to_container())
            .await;
        self.store.save_metrics(&self.state.metrics).await;
        self.state.refresh_gauges();
        Ok(())
    }
}
