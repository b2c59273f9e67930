// src/reconcile.rs
// Detects and repairs divergence between local belief and exchange truth:
// startup order matching with orphan cancellation, per-position TP/SL
// repair, and synthesis of trade history for positions that predate this
// process. Conflicts here are expected steady-state events, not errors.

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::BotError;
use crate::exchange::{find_tp_sl, ExchangeGateway, ExchangeOrder, ExchangeOrderStatus};
use crate::persistence::Store;
use crate::risk::{fallback_tp_sl, round_down_to_step, round_to_tick};
use crate::state::BotState;
use crate::types::{Position, PositionSide};
use crate::zones::detector::latest_active_block;
use crate::zones::{detect_order_blocks, DetectorConfig};

/// Startup pass: match every open exchange order against local tracking,
/// adopt strays that still line up with an active order block, cancel the
/// rest as orphans, and resolve locally tracked orders the exchange has
/// forgotten.
pub async fn reconcile_live_orders(
    gateway: &dyn ExchangeGateway,
    state: &mut BotState,
    store: &Store,
    config: &Config,
) {
    info!("=== Starting order reconciliation ===");
    state.add_reconciliation_log(
        "reconciliation_start",
        json!({ "message": "Starting order reconciliation" }),
    );

    let mut all_orders: Vec<ExchangeOrder> = Vec::new();
    for symbol in &config.trading_pairs {
        match gateway.fetch_open_orders(Some(symbol)).await {
            Ok(orders) => all_orders.extend(orders),
            Err(e) => warn!("Error fetching open orders for {}: {}", symbol, e),
        }
    }
    info!("Found {} open orders on exchange", all_orders.len());
    state.exchange_open_orders = all_orders.clone();
    state.refresh_gauges();

    let positions = gateway.fetch_positions().await.unwrap_or_else(|e| {
        warn!("Error fetching positions during reconciliation: {}", e);
        Vec::new()
    });

    let mut matched_order_ids: Vec<String> = Vec::new();
    let mut orphans_cancelled = 0usize;

    for order in &all_orders {
        // Tracked pending order wins the match outright
        if let Some(pending) = state.pending.get(&order.symbol) {
            if pending.order_id == order.order_id {
                matched_order_ids.push(order.order_id.clone());
                info!(
                    "✓ Matched order {} for {} with pending order",
                    order.order_id, order.symbol
                );
                state.add_reconciliation_log(
                    "order_matched",
                    json!({
                        "order_id": order.order_id,
                        "symbol": order.symbol,
                        "message": "Exchange order matched with pending order",
                    }),
                );
                continue;
            }
        }

        // Protective orders belong to positions, not to the pending set
        if order.is_protective() {
            matched_order_ids.push(order.order_id.clone());
            debug!("✓ Found TP/SL order {} for {}", order.order_id, order.symbol);
            state.add_reconciliation_log(
                "tp_sl_found",
                json!({
                    "order_id": order.order_id,
                    "symbol": order.symbol,
                    "message": "Protective order found on exchange",
                }),
            );
            continue;
        }

        // An entry order for a symbol with an open position is not ours to
        // judge; leave it for the operator
        if positions.iter().any(|p| p.symbol == order.symbol) {
            matched_order_ids.push(order.order_id.clone());
            info!(
                "Keeping unmatched order {} for {}: open position exists",
                order.order_id, order.symbol
            );
            state.add_reconciliation_log(
                "order_kept_for_position",
                json!({
                    "order_id": order.order_id,
                    "symbol": order.symbol,
                    "message": "Unmatched order kept, symbol has an open position",
                }),
            );
            continue;
        }

        info!(
            "Found unmatched entry order {} for {}",
            order.order_id, order.symbol
        );
        match adopt_or_cancel(gateway, state, config, order).await {
            Ok(adopted) => {
                if adopted {
                    matched_order_ids.push(order.order_id.clone());
                } else {
                    orphans_cancelled += 1;
                }
            }
            Err(e) => warn!(
                "Error reconciling order {} for {}: {}",
                order.order_id, order.symbol, e
            ),
        }
    }

    // Reverse pass: locally tracked orders the exchange no longer lists
    let mut removed_symbols: Vec<String> = Vec::new();
    for symbol in state.pending.symbols() {
        let Some(pending) = state.pending.get(&symbol) else {
            continue;
        };
        if matched_order_ids.contains(&pending.order_id) {
            continue;
        }
        let order_id = pending.order_id.clone();
        warn!(
            "⚠ Pending order {} for {} not found on exchange",
            order_id, symbol
        );
        let status = match gateway.fetch_order(&symbol, &order_id).await {
            Ok(Some(order)) => Some(order.status),
            Ok(None) => None,
            Err(e) => {
                warn!("Error checking orphaned order {}: {}", order_id, e);
                None
            }
        };
        let filled = match status {
            Some(ExchangeOrderStatus::Filled) => true,
            Some(s) if s.is_terminal() => false,
            Some(_) => continue, // still open on a direct lookup; keep it
            // Unknown to the exchange: a live position for the symbol means
            // the order filled before we could observe it
            None => positions.iter().any(|p| p.symbol == symbol),
        };
        if filled {
            state.metrics.filled_orders_count += 1;
        }
        state.pending.remove(&symbol);
        removed_symbols.push(symbol.clone());
        state.add_reconciliation_log(
            "orphaned_order_resolved",
            json!({
                "order_id": order_id,
                "symbol": symbol,
                "filled": filled,
                "message": "Tracked order no longer on exchange, resolved",
            }),
        );
    }

    store.save_pending_orders(&state.pending.to_container()).await;
    store.save_metrics(&state.metrics).await;
    state.refresh_gauges();

    info!(
        "=== Reconciliation complete: {} matched, {} orphans cancelled, {} stale local entries ===",
        matched_order_ids.len(),
        orphans_cancelled,
        removed_symbols.len()
    );
    state.add_reconciliation_log(
        "reconciliation_complete",
        json!({
            "matched_orders": matched_order_ids.len(),
            "orphaned_orders": removed_symbols.len(),
            "cancelled_orders": orphans_cancelled,
            "message": "Order reconciliation completed",
        }),
    );
}

/// An unmatched entry order is adopted when it still sits on an active order
/// block boundary for its side; otherwise it is an orphan and cancelled.
/// Returns Ok(true) when adopted.
async fn adopt_or_cancel(
    gateway: &dyn ExchangeGateway,
    state: &mut BotState,
    config: &Config,
    order: &ExchangeOrder,
) -> Result<bool, BotError> {
    let candles = gateway
        .fetch_ohlcv(&order.symbol, &config.timeframe, config.candle_limit)
        .await?;
    let detector_config = DetectorConfig {
        pivot_length: config.pivot_length,
    };
    let blocks = detect_order_blocks(&order.symbol, &candles, &detector_config)?;

    let matches_block = latest_active_block(&blocks).is_some_and(|block| {
        let boundary = block.entry_boundary();
        let expected_side = match block.block_type {
            crate::types::BlockType::Bullish => crate::types::Side::Buy,
            crate::types::BlockType::Bearish => crate::types::Side::Sell,
        };
        let price = order.price.unwrap_or(0.0);
        boundary > 0.0
            && order.side == expected_side
            && ((price - boundary) / boundary).abs() < config.ob_match_tolerance
    });

    if matches_block && !state.pending.has_live(&order.symbol) {
        info!(
            "✓ Order {} matches active block, adopting into tracking",
            order.order_id
        );
        state.pending.adopt(
            &order.symbol,
            &order.order_id,
            order.side,
            order.price.unwrap_or(0.0),
            order.amount,
            order.timestamp,
        );
        state.add_reconciliation_log(
            "order_added_from_ob",
            json!({
                "order_id": order.order_id,
                "symbol": order.symbol,
                "message": "Exchange order matched an active order block, now tracked",
            }),
        );
        return Ok(true);
    }

    info!(
        "✗ Order {} has no matching block, cancelling as orphan",
        order.order_id
    );
    gateway.cancel_order(&order.symbol, &order.order_id).await?;
    state.metrics.cancelled_orders_count += 1;
    state.add_reconciliation_log(
        "order_cancelled",
        json!({
            "order_id": order.order_id,
            "symbol": order.symbol,
            "reason": "No matching order block found",
        }),
    );
    Ok(false)
}

/// Ensure every open position carries a correctly sized TP/SL pair. Missing
/// orders are placed, quantity drift beyond tolerance is cancel-and-replaced,
/// and a clean position produces zero actions (the pass is idempotent).
pub async fn reconcile_all_positions_tp_sl(
    gateway: &dyn ExchangeGateway,
    state: &mut BotState,
    store: &Store,
    config: &Config,
) {
    info!("=== Starting position TP/SL reconciliation ===");
    state.add_reconciliation_log(
        "position_reconciliation_start",
        json!({ "message": "Starting position TP/SL reconciliation" }),
    );

    let positions = match gateway.fetch_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            error!("Error fetching positions for reconciliation: {}", e);
            state.add_reconciliation_log(
                "position_reconciliation_error",
                json!({ "error": e.to_string() }),
            );
            return;
        }
    };
    info!("Found {} open positions", positions.len());

    let mut reconciled = 0usize;
    let mut failed = 0usize;
    for position in positions {
        state
            .positions
            .insert(position.symbol.clone(), position.clone());
        match reconcile_position_tp_sl(gateway, state, config, &position).await {
            Ok(()) => reconciled += 1,
            Err(e) => {
                failed += 1;
                warn!("Error reconciling TP/SL for {}: {}", position.symbol, e);
                state.add_reconciliation_log(
                    "reconciliation_error",
                    json!({
                        "symbol": position.symbol,
                        "error": e.to_string(),
                    }),
                );
            }
        }
    }

    store.save_metrics(&state.metrics).await;
    info!(
        "=== Position reconciliation complete: {} reconciled, {} failed ===",
        reconciled, failed
    );
    state.add_reconciliation_log(
        "position_reconciliation_complete",
        json!({
            "reconciled": reconciled,
            "failed": failed,
            "message": "Position TP/SL reconciliation completed",
        }),
    );
}

async fn reconcile_position_tp_sl(
    gateway: &dyn ExchangeGateway,
    state: &mut BotState,
    config: &Config,
    position: &Position,
) -> Result<(), BotError> {
    if position.size <= 0.0 {
        return Ok(());
    }
    let symbol = &position.symbol;
    let is_long = position.side == PositionSide::Long;
    debug!(
        "Reconciling TP/SL for {} ({}) size {} entry {}",
        symbol, position.side, position.size, position.entry_price
    );

    let filters = gateway.symbol_filters(symbol).await?;
    let formatted_size = round_down_to_step(position.size, filters.qty_step);
    if formatted_size <= 0.0 {
        return Ok(());
    }

    // Prices: pending order context first, percentage fallback otherwise
    let (tp_price, sl_price) = match state.pending.get(symbol) {
        Some(pending) if pending.take_profit > 0.0 && pending.stop_loss > 0.0 => {
            (pending.take_profit, pending.stop_loss)
        }
        _ => fallback_tp_sl(
            position.entry_price,
            is_long,
            config.fallback_risk_pct,
            config.reward_ratio,
        ),
    };
    let tp_price = round_to_tick(tp_price, filters.price_tick);
    let sl_price = round_to_tick(sl_price, filters.price_tick);

    let open_orders = gateway.fetch_open_orders(Some(symbol)).await?;
    let (sl_order, tp_order) = find_tp_sl(&open_orders, symbol);
    let tolerance = formatted_size * config.tp_sl_quantity_tolerance;

    let mut needs_sl = false;
    match sl_order {
        None => {
            warn!("⚠ Missing SL order for {} ({})", symbol, position.side);
            needs_sl = true;
            state.add_reconciliation_log(
                "missing_sl_detected",
                json!({
                    "symbol": symbol,
                    "position_size": position.size,
                    "message": "Position exists without SL order",
                }),
            );
        }
        Some(order) if (order.amount - formatted_size).abs() > tolerance => {
            warn!(
                "⚠ SL quantity mismatch for {}: {} vs {}",
                symbol, order.amount, formatted_size
            );
            needs_sl = true;
            gateway.cancel_order(symbol, &order.order_id).await?;
            state.add_reconciliation_log(
                "sl_quantity_mismatch",
                json!({
                    "symbol": symbol,
                    "expected": formatted_size,
                    "actual": order.amount,
                    "message": "SL order quantity mismatch, cancelling",
                }),
            );
        }
        Some(_) => {}
    }

    let mut needs_tp = false;
    match tp_order {
        None => {
            warn!("⚠ Missing TP order for {} ({})", symbol, position.side);
            needs_tp = true;
            state.add_reconciliation_log(
                "missing_tp_detected",
                json!({
                    "symbol": symbol,
                    "position_size": position.size,
                    "message": "Position exists without TP order",
                }),
            );
        }
        Some(order) if (order.amount - formatted_size).abs() > tolerance => {
            warn!(
                "⚠ TP quantity mismatch for {}: {} vs {}",
                symbol, order.amount, formatted_size
            );
            needs_tp = true;
            gateway.cancel_order(symbol, &order.order_id).await?;
            state.add_reconciliation_log(
                "tp_quantity_mismatch",
                json!({
                    "symbol": symbol,
                    "expected": formatted_size,
                    "actual": order.amount,
                    "message": "TP order quantity mismatch, cancelling",
                }),
            );
        }
        Some(_) => {}
    }

    if !needs_sl && !needs_tp {
        debug!("✓ TP/SL orders are correct for {}", symbol);
        return Ok(());
    }

    let close_side = position.side.close_side();
    if needs_sl {
        gateway
            .place_stop_loss(symbol, close_side, formatted_size, sl_price)
            .await?;
    }
    if needs_tp {
        gateway
            .place_take_profit(symbol, close_side, formatted_size, tp_price)
            .await?;
    }
    info!(
        "✓ Placed protective orders for {}: SL {} TP {} size {}",
        symbol, sl_price, tp_price, formatted_size
    );
    state.add_reconciliation_log(
        "tp_sl_placed",
        json!({
            "symbol": symbol,
            "sl_price": sl_price,
            "tp_price": tp_price,
            "size": formatted_size,
            "message": "Protective orders placed",
        }),
    );
    Ok(())
}

/// Startup pass: positions opened before this process last ran still get an
/// OPEN ledger entry synthesized from exchange-reported data.
pub async fn reconcile_positions_with_trades(
    gateway: &dyn ExchangeGateway,
    state: &mut BotState,
    store: &Store,
) {
    info!("=== Reconciling existing positions with trade history ===");
    let positions = match gateway.fetch_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            warn!("Error fetching positions for trade reconciliation: {}", e);
            return;
        }
    };

    let mut synthesized = 0usize;
    for position in positions {
        if position.size <= 0.0 || state.has_open_trade(&position.symbol) {
            continue;
        }
        info!(
            "Creating trade entry for existing position: {} {}",
            position.symbol, position.side
        );
        state.add_open_trade(
            &position.symbol,
            position.side,
            position.entry_price,
            position.size,
            position.entry_time,
        );
        state.add_reconciliation_log(
            "trade_synthesized",
            json!({
                "symbol": position.symbol,
                "side": position.side.to_string(),
                "entry_price": position.entry_price,
                "message": "Trade entry created for pre-existing position",
            }),
        );
        synthesized += 1;
    }

    if synthesized > 0 {
        store.save_trade_history(&state.trade_history).await;
    }
    info!(
        "=== Position-trade reconciliation complete: {} entries synthesized ===",
        synthesized
    );
}
