// src/persistence.rs
// Durable JSON snapshots: pending orders, metrics, trade history and the
// balance history series. Full-file overwrite on every save; a missing or
// corrupt file loads as the empty default so a bad disk never stops the bot.

use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::types::{BalancePoint, Metrics, PendingOrdersContainer, TradeRecord};

pub const PENDING_ORDERS_FILE: &str = "pending_orders.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const TRADE_HISTORY_FILE: &str = "trade_history.json";
pub const BALANCE_HISTORY_FILE: &str = "balance_history.json";

#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub async fn load_pending_orders(&self) -> PendingOrdersContainer {
        self.load_or_default(PENDING_ORDERS_FILE).await
    }

    pub async fn save_pending_orders(&self, container: &PendingOrdersContainer) {
        self.save(PENDING_ORDERS_FILE, container).await;
    }

    pub async fn load_metrics(&self) -> Metrics {
        self.load_or_default(METRICS_FILE).await
    }

    pub async fn save_metrics(&self, metrics: &Metrics) {
        self.save(METRICS_FILE, metrics).await;
    }

    pub async fn load_trade_history(&self) -> Vec<TradeRecord> {
        self.load_or_default(TRADE_HISTORY_FILE).await
    }

    pub async fn save_trade_history(&self, trades: &[TradeRecord]) {
        self.save(TRADE_HISTORY_FILE, &trades).await;
    }

    pub async fn load_balance_history(&self) -> Vec<BalancePoint> {
        self.load_or_default(BALANCE_HISTORY_FILE).await
    }

    pub async fn save_balance_history(&self, points: &[BalancePoint]) {
        self.save(BALANCE_HISTORY_FILE, &points).await;
    }

    async fn load_or_default<T: DeserializeOwned + Default>(&self, file: &str) -> T {
        let path = self.dir.join(file);
        match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "Could not parse {}: {}, starting with empty state",
                        path.display(),
                        e
                    );
                    T::default()
                }
            },
            Err(_) => {
                debug!("No existing {} found, starting fresh", path.display());
                T::default()
            }
        }
    }

    /// Write failures are warnings only; in-memory state stays authoritative
    /// and the next successful write supersedes.
    async fn save<T: Serialize>(&self, file: &str, value: &T) {
        let path = self.dir.join(file);
        let json = match serde_json::to_string_pretty(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {}: {}", path.display(), e);
                return;
            }
        };
        if let Err(e) = fs::create_dir_all(&self.dir).await {
            warn!("Failed to create data dir {}: {}", self.dir.display(), e);
            return;
        }
        if let Err(e) = fs::write(&path, json).await {
            warn!("Failed to write {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderState, PendingOrder, Side};
    use chrono::Utc;

    fn sample_order(symbol: &str) -> PendingOrder {
        PendingOrder {
            symbol: symbol.to_string(),
            side: Side::Buy,
            entry_price: 100.0,
            quantity: 10.0,
            take_profit: 110.0,
            stop_loss: 95.0,
            order_id: "42".to_string(),
            state: OrderState::PartiallyFilled,
            remaining_quantity: 6.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn pending_orders_round_trip_field_for_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut container = PendingOrdersContainer::default();
        container
            .orders
            .insert("BTC/USDT".to_string(), sample_order("BTC/USDT"));
        container
            .orders
            .insert("ETH/USDT".to_string(), sample_order("ETH/USDT"));

        store.save_pending_orders(&container).await;
        let loaded = store.load_pending_orders().await;

        assert_eq!(loaded.orders.len(), 2);
        assert_eq!(loaded.orders["BTC/USDT"], container.orders["BTC/USDT"]);
        assert_eq!(loaded.orders["ETH/USDT"], container.orders["ETH/USDT"]);
    }

    #[tokio::test]
    async fn missing_file_yields_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.load_pending_orders().await.orders.is_empty());
        assert_eq!(store.load_metrics().await, Metrics::default());
        assert!(store.load_trade_history().await.is_empty());
        assert!(store.load_balance_history().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_yields_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        std::fs::write(dir.path().join(METRICS_FILE), "{not valid json").unwrap();
        assert_eq!(store.load_metrics().await, Metrics::default());
    }

    #[tokio::test]
    async fn metrics_tolerate_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        std::fs::write(
            dir.path().join(METRICS_FILE),
            r#"{"placed_orders_count": 7}"#,
        )
        .unwrap();
        let metrics = store.load_metrics().await;
        assert_eq!(metrics.placed_orders_count, 7);
        assert_eq!(metrics.cancelled_orders_count, 0);
    }

    #[tokio::test]
    async fn save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut metrics = Metrics::default();
        metrics.placed_orders_count = 1;
        store.save_metrics(&metrics).await;
        metrics.placed_orders_count = 2;
        store.save_metrics(&metrics).await;

        assert_eq!(store.load_metrics().await.placed_orders_count, 2);
    }
}
