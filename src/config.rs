// src/config.rs
// Environment-driven runtime configuration

use std::env;

use crate::errors::BotError;

/// Runtime configuration assembled once at startup. Credentials are the only
/// hard requirement; everything else falls back to a sensible default.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_secret: String,
    pub bridge_url: String,
    pub trading_pairs: Vec<String>,
    pub timeframe: String,
    pub candle_limit: usize,
    pub pivot_length: usize,
    pub risk_per_trade: f64,
    pub reward_ratio: f64,
    /// Percentage-based TP/SL fallback used when a position has no pending
    /// order context to recover prices from.
    pub fallback_risk_pct: f64,
    /// Relative tolerance when comparing protective order quantity against
    /// position size before a cancel-and-replace.
    pub tp_sl_quantity_tolerance: f64,
    /// Relative tolerance when matching an unknown exchange order price to an
    /// active order block boundary at startup.
    pub ob_match_tolerance: f64,
    pub cycle_secs: u64,
    pub reconcile_interval_secs: u64,
    pub pending_stale_secs: i64,
    pub max_balance_points: usize,
    /// Safety net: force-close positions whose mark price has breached their
    /// TP/SL while the conditional orders failed to trigger.
    pub active_tp_sl_monitoring: bool,
    pub data_dir: String,
}

impl Config {
    pub fn from_env() -> Result<Self, BotError> {
        let api_key = env::var("EXCHANGE_API_KEY")
            .map_err(|_| BotError::Config("EXCHANGE_API_KEY is not set".to_string()))?;
        let api_secret = env::var("EXCHANGE_API_SECRET")
            .map_err(|_| BotError::Config("EXCHANGE_API_SECRET is not set".to_string()))?;

        let trading_pairs = env::var("TRADING_PAIRS")
            .unwrap_or_else(|_| {
                "BTC/USDT,ETH/USDT,SOL/USDT,UNI/USDT,DOT/USDT,BNB/USDT,ADA/USDT,LTC/USDT,AVAX/USDT,XRP/USDT,DOGE/USDT"
                    .to_string()
            })
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            api_key,
            api_secret,
            bridge_url: env::var("EXCHANGE_BRIDGE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            trading_pairs,
            timeframe: env::var("TIMEFRAME").unwrap_or_else(|_| "30m".to_string()),
            candle_limit: parse_env("CANDLE_LIMIT", 100),
            pivot_length: parse_env("PIVOT_LENGTH", 5),
            risk_per_trade: parse_env("RISK_PER_TRADE", 0.01),
            reward_ratio: parse_env("REWARD_RATIO", 2.0),
            fallback_risk_pct: parse_env("TP_SL_FALLBACK_RISK_PCT", 0.01),
            tp_sl_quantity_tolerance: parse_env("TP_SL_QUANTITY_TOLERANCE", 0.01),
            ob_match_tolerance: parse_env("OB_MATCH_TOLERANCE", 0.005),
            cycle_secs: parse_env("CYCLE_INTERVAL_SECONDS", 120),
            reconcile_interval_secs: parse_env("POSITION_RECONCILIATION_INTERVAL", 600),
            pending_stale_secs: parse_env("PENDING_ORDER_STALE_SECONDS", 900),
            max_balance_points: parse_env("MAX_BALANCE_HISTORY_POINTS", 5000),
            active_tp_sl_monitoring: env::var("ENABLE_ACTIVE_TP_SL_MONITORING")
                .map(|v| v.trim().to_lowercase() == "true")
                .unwrap_or(true),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
        })
    }
}

fn parse_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_on_garbage() {
        env::set_var("TEST_PARSE_ENV_GARBAGE", "not-a-number");
        assert_eq!(parse_env("TEST_PARSE_ENV_GARBAGE", 42u64), 42);
        env::remove_var("TEST_PARSE_ENV_GARBAGE");
    }

    #[test]
    fn missing_credentials_are_fatal() {
        env::remove_var("EXCHANGE_API_KEY");
        env::remove_var("EXCHANGE_API_SECRET");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, BotError::Config(_)));
    }
}
