//! Derived-State Caches.
//!
//! Pure projections of committed store state, rebuilt with
//! [`DerivedStateCaches::refresh_all`] and advanced by the orchestrator after
//! each commit. Mutations of the block in flight are kept in
//! [`StagedCacheUpdates`] and only reach the shared caches once the block
//! has committed.

pub mod oracle_price;
pub mod vault;

pub use oracle_price::{OraclePriceCache, OraclePriceEntry};
pub use vault::VaultCache;

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::mutation::Mutation;
use crate::store::{BlockStore, StoreError};

/// Both caches, owned by the ingestion process and cloned by handle.
#[derive(Debug, Clone, Default)]
pub struct DerivedStateCaches {
    oracle_prices: OraclePriceCache,
    vaults: VaultCache,
}

impl DerivedStateCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild both caches from committed store state.
    #[tracing::instrument(skip_all, err)]
    pub async fn refresh_all(&self, store: &dyn BlockStore) -> Result<(), StoreError> {
        let prices = store.latest_oracle_prices().await?;
        let vaults = store.vault_member_addresses().await?;
        tracing::info!(
            markets = prices.len(),
            vaults = vaults.len(),
            "Derived-state caches rebuilt"
        );
        self.oracle_prices.replace_all(prices).await;
        self.vaults.replace_all(vaults).await;
        Ok(())
    }

    /// Advance the caches with the staged changes of a committed block.
    pub(crate) async fn apply_committed(&self, staged: StagedCacheUpdates) {
        for (market_id, pair) in staged.renamed_markets {
            self.oracle_prices.rename(market_id, &pair).await;
        }
        self.oracle_prices
            .apply(staged.oracle_prices.into_values())
            .await;
        self.vaults.apply(staged.vaults).await;
    }

    /// Read-only handle for consumers outside the orchestrator.
    pub fn reader(&self) -> CacheReader {
        CacheReader {
            caches: self.clone(),
        }
    }

    pub fn oracle_prices(&self) -> &OraclePriceCache {
        &self.oracle_prices
    }

    pub fn vaults(&self) -> &VaultCache {
        &self.vaults
    }
}

/// Lookups exposed to in-process consumers. It cannot mutate the caches.
#[derive(Debug, Clone)]
pub struct CacheReader {
    caches: DerivedStateCaches,
}

impl CacheReader {
    pub async fn oracle_price(&self, ticker: &str) -> Option<Decimal> {
        self.caches.oracle_prices.get(ticker).await
    }

    pub async fn oracle_price_by_market(&self, market_id: i64) -> Option<OraclePriceEntry> {
        self.caches.oracle_prices.get_by_market(market_id).await
    }

    pub async fn is_vault(&self, address: &str) -> bool {
        self.caches.vaults.contains(address).await
    }

    pub async fn market_count(&self) -> usize {
        self.caches.oracle_prices.len().await
    }

    pub async fn vault_count(&self) -> usize {
        self.caches.vaults.len().await
    }
}

/// Cache changes made by the block in flight.
#[derive(Debug, Clone, Default)]
pub struct StagedCacheUpdates {
    oracle_prices: HashMap<i64, OraclePriceEntry>,
    renamed_markets: Vec<(i64, String)>,
    vaults: Vec<(String, bool)>,
}

impl StagedCacheUpdates {
    pub fn stage(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::AppendOraclePrice(append) => {
                self.oracle_prices.insert(
                    append.price.market_id,
                    OraclePriceEntry {
                        market_id: append.price.market_id,
                        pair: append.pair.clone(),
                        price: append.price.price,
                        effective_at_height: append.price.effective_at_height,
                    },
                );
            }
            Mutation::UpdateMarket(market) => {
                if let Some(entry) = self.oracle_prices.get_mut(&market.id) {
                    entry.pair = market.pair.clone();
                }
                self.renamed_markets.push((market.id, market.pair.clone()));
            }
            Mutation::UpsertVault(vault) => {
                self.vaults.push((vault.address.clone(), vault.is_member()));
            }
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.oracle_prices.is_empty() && self.renamed_markets.is_empty() && self.vaults.is_empty()
    }
}

/// What handlers see: the block's staged changes over the committed caches.
#[derive(Clone, Copy)]
pub struct CacheView<'a> {
    committed: &'a DerivedStateCaches,
    staged: &'a StagedCacheUpdates,
}

impl<'a> CacheView<'a> {
    pub fn new(committed: &'a DerivedStateCaches, staged: &'a StagedCacheUpdates) -> Self {
        Self { committed, staged }
    }

    pub async fn oracle_price_by_market(&self, market_id: i64) -> Option<OraclePriceEntry> {
        if let Some(entry) = self.staged.oracle_prices.get(&market_id) {
            return Some(entry.clone());
        }
        self.committed.oracle_prices.get_by_market(market_id).await
    }

    pub async fn is_vault(&self, address: &str) -> bool {
        let staged = self
            .staged
            .vaults
            .iter()
            .rev()
            .find(|(staged_address, _)| staged_address == address);
        match staged {
            Some((_, is_member)) => *is_member,
            None => self.committed.vaults.contains(address).await,
        }
    }
}
