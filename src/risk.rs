// src/risk.rs
// Turns an active order block into a concrete order specification, or
// declines. Sizing risks a fixed fraction of equity between entry and stop.

use tracing::debug;

use crate::exchange::SymbolFilters;
use crate::types::{BlockType, OrderBlock, Side};

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade (0.01 = 1%).
    pub risk_per_trade: f64,
    /// Reward:risk multiple for the take-profit distance.
    pub reward_ratio: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: 0.01,
            reward_ratio: 2.0,
        }
    }
}

/// A fully priced order ready to hand to the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Entry sits at the zone boundary nearer to price so the order fills on a
/// retrace; the stop is the opposite boundary. Declines (returns `None`)
/// when equity is non-positive, price has already passed the entry boundary,
/// the zone has no usable height, or the sized quantity rounds to zero under
/// the symbol's precision rules.
pub fn size_order(
    block: &OrderBlock,
    equity: f64,
    current_price: f64,
    filters: &SymbolFilters,
    config: &RiskConfig,
) -> Option<OrderSpec> {
    if equity <= 0.0 || !equity.is_finite() {
        return None;
    }

    let (side, entry_price, stop_loss) = match block.block_type {
        BlockType::Bullish => {
            // Price must retrace down into the zone to trigger the buy
            if current_price <= block.zone_top {
                return None;
            }
            (Side::Buy, block.zone_top, block.zone_bottom)
        }
        BlockType::Bearish => {
            if current_price >= block.zone_bottom {
                return None;
            }
            (Side::Sell, block.zone_bottom, block.zone_top)
        }
    };

    let risk_per_unit = (entry_price - stop_loss).abs();
    if !(risk_per_unit > 0.0) || !risk_per_unit.is_finite() {
        debug!(
            "Declining block for {}: zone has no height ({} / {})",
            block.symbol, block.zone_top, block.zone_bottom
        );
        return None;
    }

    let risk_amount = equity * config.risk_per_trade;
    let quantity = round_down_to_step(risk_amount / risk_per_unit, filters.qty_step);
    if quantity <= 0.0 {
        debug!(
            "Declining {} order for {}: quantity rounds to zero",
            side, block.symbol
        );
        return None;
    }

    let take_profit = match side {
        Side::Buy => entry_price + risk_per_unit * config.reward_ratio,
        Side::Sell => entry_price - risk_per_unit * config.reward_ratio,
    };

    Some(OrderSpec {
        symbol: block.symbol.clone(),
        side,
        entry_price: round_to_tick(entry_price, filters.price_tick),
        quantity,
        stop_loss: round_to_tick(stop_loss, filters.price_tick),
        take_profit: round_to_tick(take_profit, filters.price_tick),
    })
}

/// Round a price to the nearest valid tick (half up).
pub fn round_to_tick(value: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round a quantity down to the exchange step so sized risk is never
/// exceeded. The small epsilon keeps an exact multiple of the step from
/// flooring one step short of itself.
pub fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step + 1e-9).floor() * step
}

/// Percentage-based TP/SL fallback used by reconciliation when a position
/// has no originating order context left.
pub fn fallback_tp_sl(
    entry_price: f64,
    is_long: bool,
    risk_pct: f64,
    reward_ratio: f64,
) -> (f64, f64) {
    if is_long {
        (
            entry_price * (1.0 + risk_pct * reward_ratio),
            entry_price * (1.0 - risk_pct),
        )
    } else {
        (
            entry_price * (1.0 - risk_pct * reward_ratio),
            entry_price * (1.0 + risk_pct),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockState, BlockType};
    use chrono::Utc;

    fn block(block_type: BlockType, top: f64, bottom: f64) -> OrderBlock {
        OrderBlock {
            symbol: "BTC/USDT".to_string(),
            block_type,
            zone_top: top,
            zone_bottom: bottom,
            formation_time: Utc::now(),
            state: BlockState::Active,
        }
    }

    fn filters() -> SymbolFilters {
        SymbolFilters {
            price_tick: 0.1,
            qty_step: 0.001,
        }
    }

    #[test]
    fn sizes_bullish_order_at_one_percent_risk() {
        let block = block(BlockType::Bullish, 100.0, 95.0);
        let spec = size_order(&block, 10_000.0, 110.0, &filters(), &RiskConfig::default())
            .expect("order expected");
        assert_eq!(spec.side, Side::Buy);
        assert_eq!(spec.entry_price, 100.0);
        assert_eq!(spec.stop_loss, 95.0);
        assert_eq!(spec.take_profit, 110.0); // 100 + 2 * 5
        // 1% of 10k = 100 risked over a 5.0 stop distance
        assert!((spec.quantity - 20.0).abs() < 1e-9);
    }

    #[test]
    fn sizes_bearish_order_mirrored() {
        let block = block(BlockType::Bearish, 105.0, 100.0);
        let spec = size_order(&block, 10_000.0, 90.0, &filters(), &RiskConfig::default())
            .expect("order expected");
        assert_eq!(spec.side, Side::Sell);
        assert_eq!(spec.entry_price, 100.0);
        assert_eq!(spec.stop_loss, 105.0);
        assert_eq!(spec.take_profit, 90.0); // 100 - 2 * 5
    }

    #[test]
    fn declines_without_retrace_room() {
        // Price already below the bullish entry boundary
        let block = block(BlockType::Bullish, 100.0, 95.0);
        assert!(size_order(&block, 10_000.0, 99.0, &filters(), &RiskConfig::default()).is_none());
    }

    #[test]
    fn declines_on_non_positive_equity() {
        let block = block(BlockType::Bullish, 100.0, 95.0);
        assert!(size_order(&block, 0.0, 110.0, &filters(), &RiskConfig::default()).is_none());
        assert!(size_order(&block, -50.0, 110.0, &filters(), &RiskConfig::default()).is_none());
    }

    #[test]
    fn declines_when_quantity_rounds_to_zero() {
        let block = block(BlockType::Bullish, 100.0, 95.0);
        let coarse = SymbolFilters {
            price_tick: 0.1,
            qty_step: 1.0,
        };
        // 1% of 10 = 0.1 risked over 5.0 -> 0.02, floors to 0 under step 1.0
        assert!(size_order(&block, 10.0, 110.0, &coarse, &RiskConfig::default()).is_none());
    }

    #[test]
    fn declines_on_zero_height_zone() {
        let block = block(BlockType::Bullish, 100.0, 100.0);
        assert!(size_order(&block, 10_000.0, 110.0, &filters(), &RiskConfig::default()).is_none());
    }

    #[test]
    fn rounds_prices_to_tick_and_quantity_to_step() {
        let block = block(BlockType::Bullish, 100.03, 95.02);
        let filters = SymbolFilters {
            price_tick: 0.1,
            qty_step: 0.01,
        };
        let spec = size_order(&block, 10_000.0, 110.0, &filters, &RiskConfig::default())
            .expect("order expected");
        assert!((spec.entry_price - 100.0).abs() < 1e-9);
        assert!((spec.stop_loss - 95.0).abs() < 1e-9);
        // quantity floored to two decimals
        assert!((spec.quantity * 100.0).fract().abs() < 1e-6);
    }

    #[test]
    fn fallback_levels_are_side_aware() {
        let (tp, sl) = fallback_tp_sl(100.0, true, 0.01, 2.0);
        assert!((tp - 102.0).abs() < 1e-9);
        assert!((sl - 99.0).abs() < 1e-9);

        let (tp, sl) = fallback_tp_sl(100.0, false, 0.01, 2.0);
        assert!((tp - 98.0).abs() < 1e-9);
        assert!((sl - 101.0).abs() < 1e-9);
    }
}
