use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::entities::market::LatestOraclePrice;

/// Latest committed price of one market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OraclePriceEntry {
    pub market_id: i64,
    pub pair: String,
    pub price: Decimal,
    pub effective_at_height: i64,
}

impl From<LatestOraclePrice> for OraclePriceEntry {
    fn from(value: LatestOraclePrice) -> Self {
        Self {
            market_id: value.market_id,
            pair: value.pair,
            price: value.price,
            effective_at_height: value.effective_at_height,
        }
    }
}

#[derive(Debug, Default)]
struct OraclePrices {
    by_market: HashMap<i64, OraclePriceEntry>,
    market_by_ticker: HashMap<String, i64>,
}

impl OraclePrices {
    fn insert(&mut self, entry: OraclePriceEntry) {
        let renamed = self
            .by_market
            .get(&entry.market_id)
            .filter(|previous| previous.pair != entry.pair);
        if let Some(previous) = renamed {
            self.market_by_ticker.remove(&previous.pair);
        }
        self.market_by_ticker.insert(entry.pair.clone(), entry.market_id);
        self.by_market.insert(entry.market_id, entry);
    }
}

/// Ticker to latest oracle price projection of the `oracle_prices` table.
#[derive(Debug, Clone, Default)]
pub struct OraclePriceCache {
    inner: Arc<RwLock<OraclePrices>>,
}

impl OraclePriceCache {
    pub async fn get(&self, ticker: &str) -> Option<Decimal> {
        let prices = self.inner.read().await;
        let market_id = prices.market_by_ticker.get(ticker)?;
        prices.by_market.get(market_id).map(|entry| entry.price)
    }

    pub async fn get_by_market(&self, market_id: i64) -> Option<OraclePriceEntry> {
        self.inner.read().await.by_market.get(&market_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_market.len()
    }

    pub(crate) async fn replace_all(&self, latest: Vec<LatestOraclePrice>) {
        let mut rebuilt = OraclePrices::default();
        for price in latest {
            rebuilt.insert(price.into());
        }
        *self.inner.write().await = rebuilt;
    }

    pub(crate) async fn apply(&self, entries: impl IntoIterator<Item = OraclePriceEntry>) {
        let mut prices = self.inner.write().await;
        for entry in entries {
            prices.insert(entry);
        }
    }

    /// Rename the ticker of a cached market after its pair changed.
    pub(crate) async fn rename(&self, market_id: i64, pair: &str) {
        let mut prices = self.inner.write().await;
        if let Some(entry) = prices.by_market.get(&market_id).cloned() {
            prices.insert(OraclePriceEntry {
                pair: pair.to_string(),
                ..entry
            });
        }
    }
}
