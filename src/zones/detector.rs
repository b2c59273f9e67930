// src/zones/detector.rs
// Order block detection: swing pivots, market structure breaks, and the
// mitigation/invalidation lifecycle over subsequent price action.

use tracing::debug;

use crate::errors::BotError;
use crate::types::{BlockState, BlockType, Candle, OrderBlock};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Candles checked on each side of a potential swing pivot. A pivot is
    /// only confirmed once this many candles exist after it.
    pub pivot_length: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { pivot_length: 5 }
    }
}

/// Detect order blocks over an ascending candle series for one symbol.
///
/// A bullish block forms when a confirmed swing low is followed by a candle
/// closing above the most recent prior swing high (a market structure break
/// to the upside); the pivot candle's full wick range becomes the zone.
/// Bearish blocks are symmetric. Each block then walks the remaining candles
/// to pick up mitigation (price re-enters the zone and exits in the expected
/// direction) or invalidation (a close through the zone on the wrong side).
///
/// Fewer candles than one full pivot window yields no candidates. A series
/// with non-ascending timestamps or non-finite prices is rejected outright.
pub fn detect_order_blocks(
    symbol: &str,
    candles: &[Candle],
    config: &DetectorConfig,
) -> Result<Vec<OrderBlock>, BotError> {
    validate_candles(symbol, candles)?;

    let n = config.pivot_length;
    if n == 0 || candles.len() < 2 * n + 1 {
        return Ok(Vec::new());
    }

    let pivot_highs = find_pivots(candles, n, Extreme::High);
    let pivot_lows = find_pivots(candles, n, Extreme::Low);

    let mut blocks = Vec::new();

    // Bullish: swing low broken upward through the prior swing high
    for &pivot in &pivot_lows {
        let Some(prior_high) = last_pivot_before(&pivot_highs, pivot) else {
            continue;
        };
        let break_level = candles[prior_high].high;
        if let Some(break_idx) = (pivot + 1..candles.len())
            .find(|&j| candles[j].close > break_level)
        {
            let block = track_lifecycle(
                symbol,
                BlockType::Bullish,
                &candles[pivot],
                &candles[break_idx + 1..],
            );
            debug!(
                "Bullish block for {} at [{:.8}, {:.8}] -> {:?}",
                symbol, block.zone_bottom, block.zone_top, block.state
            );
            blocks.push(block);
        }
    }

    // Bearish: swing high broken downward through the prior swing low
    for &pivot in &pivot_highs {
        let Some(prior_low) = last_pivot_before(&pivot_lows, pivot) else {
            continue;
        };
        let break_level = candles[prior_low].low;
        if let Some(break_idx) = (pivot + 1..candles.len())
            .find(|&j| candles[j].close < break_level)
        {
            let block = track_lifecycle(
                symbol,
                BlockType::Bearish,
                &candles[pivot],
                &candles[break_idx + 1..],
            );
            debug!(
                "Bearish block for {} at [{:.8}, {:.8}] -> {:?}",
                symbol, block.zone_bottom, block.zone_top, block.state
            );
            blocks.push(block);
        }
    }

    blocks.sort_by_key(|b| b.formation_time);
    Ok(blocks)
}

fn validate_candles(symbol: &str, candles: &[Candle]) -> Result<(), BotError> {
    for window in candles.windows(2) {
        if window[1].open_time <= window[0].open_time {
            return Err(BotError::Data(format!(
                "Non-monotonic candle timestamps for {} at {}",
                symbol, window[1].open_time
            )));
        }
    }
    for candle in candles {
        let values = [candle.open, candle.high, candle.low, candle.close];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(BotError::Data(format!(
                "Non-finite price in {} candle at {}",
                symbol, candle.open_time
            )));
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Extreme {
    High,
    Low,
}

/// Confirmed pivot indices. Ties against earlier candles are allowed and
/// ties against later candles are not, so an equal-extreme pair resolves to
/// the most recent candle.
fn find_pivots(candles: &[Candle], n: usize, extreme: Extreme) -> Vec<usize> {
    let mut pivots = Vec::new();
    for i in n..candles.len() - n {
        let value = extreme_value(&candles[i], extreme);
        let before_ok = candles[i - n..i].iter().all(|c| match extreme {
            Extreme::High => value >= extreme_value(c, extreme),
            Extreme::Low => value <= extreme_value(c, extreme),
        });
        let after_ok = candles[i + 1..=i + n].iter().all(|c| match extreme {
            Extreme::High => value > extreme_value(c, extreme),
            Extreme::Low => value < extreme_value(c, extreme),
        });
        if before_ok && after_ok {
            pivots.push(i);
        }
    }
    pivots
}

fn extreme_value(candle: &Candle, extreme: Extreme) -> f64 {
    match extreme {
        Extreme::High => candle.high,
        Extreme::Low => candle.low,
    }
}

fn last_pivot_before(pivots: &[usize], index: usize) -> Option<usize> {
    pivots.iter().rev().find(|&&p| p < index).copied()
}

/// Walk candles after the structure break and settle the block's state.
fn track_lifecycle(
    symbol: &str,
    block_type: BlockType,
    pivot: &Candle,
    after_break: &[Candle],
) -> OrderBlock {
    let zone_top = pivot.high;
    let zone_bottom = pivot.low;

    let mut state = BlockState::Active;
    let mut entered = false;

    for candle in after_break {
        match block_type {
            BlockType::Bullish => {
                if candle.close < zone_bottom {
                    state = BlockState::Invalidated;
                    break;
                }
                if candle.low <= zone_top {
                    entered = true;
                }
                if entered && candle.close > zone_top {
                    state = BlockState::Mitigated;
                    break;
                }
            }
            BlockType::Bearish => {
                if candle.close > zone_top {
                    state = BlockState::Invalidated;
                    break;
                }
                if candle.high >= zone_bottom {
                    entered = true;
                }
                if entered && candle.close < zone_bottom {
                    state = BlockState::Mitigated;
                    break;
                }
            }
        }
    }

    OrderBlock {
        symbol: symbol.to_string(),
        block_type,
        zone_top,
        zone_bottom,
        formation_time: pivot.open_time,
        state,
    }
}

/// The single block allowed to drive order placement for a symbol: the most
/// recently formed one that is still active.
pub fn latest_active_block(blocks: &[OrderBlock]) -> Option<&OrderBlock> {
    blocks.iter().filter(|b| b.is_active()).max_by_key(|b| b.formation_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(30 * i),
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    fn flat(i: i64, price: f64) -> Candle {
        candle(i, price, price + 0.5, price - 0.5, price)
    }

    /// Series with a swing high at index 2 (high 105.5), a swing low at
    /// index 6 (low 94.5), and a structure break at index 9 closing above
    /// the swing high.
    fn bullish_series() -> Vec<Candle> {
        vec![
            flat(0, 100.0),
            flat(1, 102.0),
            flat(2, 105.0), // swing high, high = 105.5
            flat(3, 103.0),
            flat(4, 101.0),
            flat(5, 98.0),
            candle(6, 97.0, 98.0, 94.0, 95.0), // swing low pivot candle
            flat(7, 99.0),
            flat(8, 103.0),
            candle(9, 104.0, 107.0, 103.5, 106.5), // closes above 105.5
            flat(10, 106.0),
        ]
    }

    #[test]
    fn classifies_bullish_block_from_pivot_candle() {
        let candles = bullish_series();
        let config = DetectorConfig { pivot_length: 2 };
        let blocks = detect_order_blocks("BTC/USDT", &candles, &config).unwrap();

        let bullish: Vec<_> = blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Bullish)
            .collect();
        assert_eq!(bullish.len(), 1);
        let block = bullish[0];
        assert_eq!(block.zone_top, 98.0);
        assert_eq!(block.zone_bottom, 94.0);
        assert_eq!(block.state, BlockState::Active);
        assert_eq!(block.formation_time, candles[6].open_time);
    }

    #[test]
    fn mitigated_when_price_revisits_and_exits_upward() {
        let mut candles = bullish_series();
        // Retrace into the zone then close back above its top
        candles.push(candle(11, 99.0, 100.0, 96.0, 97.0));
        candles.push(candle(12, 97.0, 101.0, 96.5, 100.0));
        let config = DetectorConfig { pivot_length: 2 };
        let blocks = detect_order_blocks("BTC/USDT", &candles, &config).unwrap();

        let block = blocks
            .iter()
            .find(|b| b.block_type == BlockType::Bullish)
            .unwrap();
        assert_eq!(block.state, BlockState::Mitigated);
    }

    #[test]
    fn invalidated_by_close_through_wrong_side() {
        let mut candles = bullish_series();
        // Close below the zone bottom before any mitigation
        candles.push(candle(11, 99.0, 100.0, 92.0, 93.0));
        let config = DetectorConfig { pivot_length: 2 };
        let blocks = detect_order_blocks("BTC/USDT", &candles, &config).unwrap();

        let block = blocks
            .iter()
            .find(|b| b.block_type == BlockType::Bullish)
            .unwrap();
        assert_eq!(block.state, BlockState::Invalidated);
    }

    #[test]
    fn insufficient_history_yields_no_candidates() {
        let candles: Vec<Candle> = (0..5).map(|i| flat(i, 100.0 + i as f64)).collect();
        let config = DetectorConfig { pivot_length: 5 };
        let blocks = detect_order_blocks("BTC/USDT", &candles, &config).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn rejects_non_monotonic_timestamps() {
        let mut candles = bullish_series();
        candles[4].open_time = candles[3].open_time;
        let config = DetectorConfig { pivot_length: 2 };
        let err = detect_order_blocks("BTC/USDT", &candles, &config).unwrap_err();
        assert!(matches!(err, BotError::Data(_)));
    }

    #[test]
    fn rejects_non_finite_prices() {
        let mut candles = bullish_series();
        candles[5].close = f64::NAN;
        let config = DetectorConfig { pivot_length: 2 };
        let err = detect_order_blocks("BTC/USDT", &candles, &config).unwrap_err();
        assert!(matches!(err, BotError::Data(_)));
    }

    #[test]
    fn equal_lows_resolve_to_most_recent_candle() {
        // Two candles share the minimum low; only the later one may confirm
        let candles = vec![
            flat(0, 100.0),
            flat(1, 102.0),
            flat(2, 105.0),
            flat(3, 103.0),
            candle(4, 97.0, 98.0, 94.0, 95.0), // tied low
            flat(5, 99.0),
            candle(6, 97.0, 98.0, 94.0, 95.0), // tied low, more recent
            flat(7, 100.0),
            flat(8, 103.0),
            candle(9, 104.0, 107.0, 103.5, 106.5),
            flat(10, 106.0),
        ];
        let config = DetectorConfig { pivot_length: 2 };
        let pivots = find_pivots(&candles, 2, Extreme::Low);
        assert_eq!(pivots, vec![6]);

        let blocks = detect_order_blocks("BTC/USDT", &candles, &config).unwrap();
        let bullish: Vec<_> = blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Bullish)
            .collect();
        assert_eq!(bullish.len(), 1);
        assert_eq!(bullish[0].formation_time, candles[6].open_time);
    }

    #[test]
    fn latest_active_block_prefers_most_recent() {
        let mk = |i: i64, state: BlockState| OrderBlock {
            symbol: "BTC/USDT".to_string(),
            block_type: BlockType::Bullish,
            zone_top: 100.0,
            zone_bottom: 95.0,
            formation_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::hours(i),
            state,
        };
        let blocks = vec![
            mk(0, BlockState::Active),
            mk(1, BlockState::Mitigated),
            mk(2, BlockState::Active),
            mk(3, BlockState::Invalidated),
        ];
        let best = latest_active_block(&blocks).unwrap();
        assert_eq!(best.formation_time, blocks[2].formation_time);
    }
}
