//! Price lookup: the read-only view the ledger engine prices trades against.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Latest known price per instrument.
///
/// Prices are raw strings as delivered by the feed; interpreting them is the
/// caller's job. Absent and stale prices look the same.
pub trait PriceLookup {
    fn latest_price(&self, instrument: &str) -> Option<String>;
}

impl PriceLookup for HashMap<String, String> {
    fn latest_price(&self, instrument: &str) -> Option<String> {
        self.get(instrument).cloned()
    }
}

/// Immutable copy of the price book taken at one instant.
#[derive(Debug, Clone, Default)]
pub struct PriceSnapshot {
    prices: HashMap<String, String>,
    taken_at: Option<DateTime<Utc>>,
}

impl PriceSnapshot {
    /// Snapshot holding a single price, for one-off CLI operations.
    pub fn single(instrument: &str, price: impl Into<String>) -> Self {
        let mut prices = HashMap::new();
        prices.insert(instrument.to_string(), price.into());
        Self {
            prices,
            taken_at: Some(Utc::now()),
        }
    }

    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        self.taken_at
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl PriceLookup for PriceSnapshot {
    fn latest_price(&self, instrument: &str) -> Option<String> {
        self.prices.get(instrument).cloned()
    }
}

/// Shared price map, written by the feed and read through snapshots.
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, instrument: &str, price: impl Into<String>) {
        self.inner
            .write()
            .await
            .insert(instrument.to_string(), price.into());
    }

    pub async fn remove(&self, instrument: &str) {
        self.inner.write().await.remove(instrument);
    }

    pub async fn get(&self, instrument: &str) -> Option<String> {
        self.inner.read().await.get(instrument).cloned()
    }

    /// Copy the current prices so an operation sees one consistent view.
    pub async fn snapshot(&self) -> PriceSnapshot {
        PriceSnapshot {
            prices: self.inner.read().await.clone(),
            taken_at: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_updates() {
        let book = PriceBook::new();
        book.update("BTC-USDT-SWAP", "60000").await;

        let snapshot = book.snapshot().await;
        book.update("BTC-USDT-SWAP", "61000").await;
        book.remove("BTC-USDT-SWAP").await;

        assert_eq!(snapshot.latest_price("BTC-USDT-SWAP").as_deref(), Some("60000"));
        assert!(book.get("BTC-USDT-SWAP").await.is_none());
        assert!(snapshot.taken_at().is_some());
    }

    #[test]
    fn test_single_snapshot() {
        let snapshot = PriceSnapshot::single("ETH-USDT-SWAP", "3000.1");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.latest_price("ETH-USDT-SWAP").as_deref(), Some("3000.1"));
        assert!(snapshot.latest_price("BTC-USDT-SWAP").is_none());
    }
}
