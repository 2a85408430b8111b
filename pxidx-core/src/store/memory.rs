//! In-memory [`BlockStore`] with the same constraint names and transactional
//! behaviour as the Postgres schema.
//!
//! Each unit of work runs on a private snapshot of the committed state and
//! publishes it on commit if no other unit of work committed in between.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BlockStore, StoreError, StoreReader, UnitOfWork};
use crate::entities::block::{
    BLOCKS_PKEY, BlockRow, TENDERMINT_EVENTS_PKEY, TRANSACTIONS_HEIGHT_INDEX_KEY,
    TendermintEventRow, TransactionRow,
};
use crate::entities::candle::{CandleResolution, CandleRow};
use crate::entities::fill::{FILLS_EVENT_ID_FKEY, FILLS_PKEY, FillRow};
use crate::entities::market::{
    AssetRow, LatestOraclePrice, LiquidityTierRow, MarketRow, OraclePriceRow, PerpetualMarketRow,
};
use crate::entities::order::{ORDERS_GOOD_TIL_CHECK, OrderRow};
use crate::entities::position::{PERPETUAL_POSITIONS_PKEY, PerpetualPositionRow};
use crate::entities::reward::{AFFILIATE_REFERRED_USERS_PKEY, AffiliateReferralRow, TradingRewardRow};
use crate::entities::subaccount::{
    ASSET_POSITIONS_SIZE_CHECK, AssetPositionRow, SUBACCOUNTS_ADDRESS_NUMBER_KEY,
    SUBACCOUNTS_PKEY, SubaccountRow, WALLETS_PKEY, WalletRow,
};
use crate::entities::transfer::TransferRow;
use crate::entities::vault::VaultRow;
use crate::entities::{EventId, PositionStatus};
use crate::mutation::{Mutation, WalletDelta};

/// Every table the engine writes, keyed by primary key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    pub blocks: BTreeMap<i64, BlockRow>,
    pub tendermint_events: BTreeMap<EventId, TendermintEventRow>,
    pub transactions: BTreeMap<Uuid, TransactionRow>,
    pub wallets: BTreeMap<String, WalletRow>,
    pub subaccounts: BTreeMap<Uuid, SubaccountRow>,
    pub asset_positions: BTreeMap<Uuid, AssetPositionRow>,
    pub assets: BTreeMap<i64, AssetRow>,
    pub markets: BTreeMap<i64, MarketRow>,
    pub liquidity_tiers: BTreeMap<i64, LiquidityTierRow>,
    pub perpetual_markets: BTreeMap<i64, PerpetualMarketRow>,
    pub oracle_prices: BTreeMap<Uuid, OraclePriceRow>,
    pub orders: BTreeMap<Uuid, OrderRow>,
    pub fills: BTreeMap<Uuid, FillRow>,
    pub perpetual_positions: BTreeMap<Uuid, PerpetualPositionRow>,
    pub transfers: BTreeMap<Uuid, TransferRow>,
    pub trading_rewards: BTreeMap<Uuid, TradingRewardRow>,
    pub vaults: BTreeMap<String, VaultRow>,
    pub affiliate_referrals: BTreeMap<String, AffiliateReferralRow>,
    pub candles: BTreeMap<Uuid, CandleRow>,
}

#[derive(Debug, Default)]
struct Shared {
    state: MemoryState,
    version: u64,
    failing_commits: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.shared.lock().await.state.clone()
    }

    /// Make the next `count` commits fail with a transient error, as a lost
    /// connection would.
    pub async fn fail_next_commits(&self, count: u32) {
        self.shared.lock().await.failing_commits = count;
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let shared = self.shared.lock().await;
        Ok(Box::new(MemoryUnitOfWork {
            shared: self.shared.clone(),
            base_version: shared.version,
            state: shared.state.clone(),
        }))
    }

    async fn last_committed_height(&self) -> Result<Option<u32>, StoreError> {
        let shared = self.shared.lock().await;
        shared
            .state
            .blocks
            .keys()
            .next_back()
            .map(|height| {
                u32::try_from(*height)
                    .map_err(|_| StoreError::Corrupt(format!("block height {height} out of range")))
            })
            .transpose()
    }

    async fn latest_oracle_prices(&self) -> Result<Vec<LatestOraclePrice>, StoreError> {
        let shared = self.shared.lock().await;
        let state = &shared.state;
        let mut latest: BTreeMap<i64, &OraclePriceRow> = BTreeMap::new();
        for price in state.oracle_prices.values() {
            let entry = latest.entry(price.market_id).or_insert(price);
            if price.event_id > entry.event_id {
                *entry = price;
            }
        }
        Ok(latest
            .into_values()
            .filter_map(|price| {
                let market = state.markets.get(&price.market_id)?;
                Some(LatestOraclePrice {
                    market_id: price.market_id,
                    pair: market.pair.clone(),
                    price: price.price,
                    effective_at_height: price.effective_at_height,
                })
            })
            .collect())
    }

    async fn vault_member_addresses(&self) -> Result<Vec<String>, StoreError> {
        let shared = self.shared.lock().await;
        Ok(shared
            .state
            .vaults
            .values()
            .filter(|vault| vault.is_member())
            .map(|vault| vault.address.clone())
            .collect())
    }
}

pub struct MemoryUnitOfWork {
    shared: Arc<Mutex<Shared>>,
    base_version: u64,
    state: MemoryState,
}

fn pkey(table: &str) -> String {
    format!("{table}_pkey")
}

fn violation(constraint: impl Into<String>, message: impl Into<String>) -> StoreError {
    StoreError::Constraint {
        constraint: constraint.into(),
        message: message.into(),
    }
}

/// Insert failing on an existing key, like a primary key constraint.
fn checked_total(total: Decimal, delta: &WalletDelta, counter: &str) -> Result<Decimal, StoreError> {
    total.checked_add(delta.amount).ok_or_else(|| {
        StoreError::Corrupt(format!("wallet {} {counter} out of range", delta.address))
    })
}

fn insert_unique<K: Ord + std::fmt::Debug, V>(
    table: &mut BTreeMap<K, V>,
    key: K,
    value: V,
    constraint: &str,
) -> Result<(), StoreError> {
    if table.contains_key(&key) {
        return Err(violation(constraint, format!("duplicate key {key:?}")));
    }
    table.insert(key, value);
    Ok(())
}

fn require<'a, K: Ord, V>(
    table: &'a mut BTreeMap<K, V>,
    key: &K,
    entity: &'static str,
    id: impl ToString,
) -> Result<&'a mut V, StoreError> {
    table
        .get_mut(key)
        .ok_or_else(|| StoreError::not_found(entity, id))
}

impl MemoryUnitOfWork {
    fn check_foreign_key(present: bool, constraint: &str, message: String) -> Result<(), StoreError> {
        if present {
            Ok(())
        } else {
            Err(violation(constraint, message))
        }
    }

    fn insert_order(state: &mut MemoryState, row: &OrderRow) -> Result<(), StoreError> {
        if !row.has_valid_good_til() {
            return Err(violation(
                ORDERS_GOOD_TIL_CHECK,
                format!("order {} must set exactly one good-til field", row.id),
            ));
        }
        Self::check_foreign_key(
            state.subaccounts.contains_key(&row.subaccount_id),
            "orders_subaccount_id_fkey",
            format!("subaccount {} missing", row.subaccount_id),
        )?;
        let created_at_height = state
            .orders
            .get(&row.id)
            .map_or(row.created_at_height, |existing| existing.created_at_height);
        state.orders.insert(
            row.id,
            OrderRow {
                created_at_height,
                ..row.clone()
            },
        );
        Ok(())
    }

    fn insert_fill(state: &mut MemoryState, row: &FillRow) -> Result<(), StoreError> {
        Self::check_foreign_key(
            state.tendermint_events.contains_key(&row.event_id),
            FILLS_EVENT_ID_FKEY,
            format!("tendermint event {} missing", row.event_id),
        )?;
        insert_unique(&mut state.fills, row.id, row.clone(), FILLS_PKEY)
    }
}

#[async_trait]
impl StoreReader for MemoryUnitOfWork {
    async fn find_wallet(&mut self, address: &str) -> Result<Option<WalletRow>, StoreError> {
        Ok(self.state.wallets.get(address).cloned())
    }

    async fn find_subaccount(&mut self, id: Uuid) -> Result<Option<SubaccountRow>, StoreError> {
        Ok(self.state.subaccounts.get(&id).cloned())
    }

    async fn find_asset_position(
        &mut self,
        subaccount_id: Uuid,
        asset_id: i64,
    ) -> Result<Option<AssetPositionRow>, StoreError> {
        Ok(self
            .state
            .asset_positions
            .values()
            .find(|position| {
                position.subaccount_id == subaccount_id && position.asset_id == asset_id
            })
            .cloned())
    }

    async fn find_asset(&mut self, id: i64) -> Result<Option<AssetRow>, StoreError> {
        Ok(self.state.assets.get(&id).cloned())
    }

    async fn find_market(&mut self, id: i64) -> Result<Option<MarketRow>, StoreError> {
        Ok(self.state.markets.get(&id).cloned())
    }

    async fn find_liquidity_tier(
        &mut self,
        id: i64,
    ) -> Result<Option<LiquidityTierRow>, StoreError> {
        Ok(self.state.liquidity_tiers.get(&id).cloned())
    }

    async fn find_perpetual_market(
        &mut self,
        id: i64,
    ) -> Result<Option<PerpetualMarketRow>, StoreError> {
        Ok(self.state.perpetual_markets.get(&id).cloned())
    }

    async fn find_perpetual_market_by_clob_pair(
        &mut self,
        clob_pair_id: i64,
    ) -> Result<Option<PerpetualMarketRow>, StoreError> {
        Ok(self
            .state
            .perpetual_markets
            .values()
            .find(|market| market.clob_pair_id == clob_pair_id)
            .cloned())
    }

    async fn find_order(&mut self, id: Uuid) -> Result<Option<OrderRow>, StoreError> {
        Ok(self.state.orders.get(&id).cloned())
    }

    async fn find_open_position(
        &mut self,
        subaccount_id: Uuid,
        perpetual_id: i64,
    ) -> Result<Option<PerpetualPositionRow>, StoreError> {
        Ok(self
            .state
            .perpetual_positions
            .values()
            .find(|position| {
                position.subaccount_id == subaccount_id
                    && position.perpetual_id == perpetual_id
                    && position.status == PositionStatus::Open
            })
            .cloned())
    }

    async fn find_vault(&mut self, address: &str) -> Result<Option<VaultRow>, StoreError> {
        Ok(self.state.vaults.get(address).cloned())
    }

    async fn find_affiliate_referral(
        &mut self,
        referee_address: &str,
    ) -> Result<Option<AffiliateReferralRow>, StoreError> {
        Ok(self.state.affiliate_referrals.get(referee_address).cloned())
    }

    async fn latest_candles(&mut self) -> Result<Vec<CandleRow>, StoreError> {
        let mut latest: BTreeMap<(&str, CandleResolution), &CandleRow> = BTreeMap::new();
        for candle in self.state.candles.values() {
            let entry = latest
                .entry((candle.ticker.as_str(), candle.resolution))
                .or_insert(candle);
            if candle.started_at > entry.started_at {
                *entry = candle;
            }
        }
        Ok(latest.into_values().cloned().collect())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_block(&mut self, row: &BlockRow) -> Result<(), StoreError> {
        insert_unique(
            &mut self.state.blocks,
            row.block_height,
            row.clone(),
            BLOCKS_PKEY,
        )
    }

    async fn insert_transactions(&mut self, rows: &[TransactionRow]) -> Result<(), StoreError> {
        for row in rows {
            let duplicate_index = self.state.transactions.values().any(|existing| {
                existing.block_height == row.block_height
                    && existing.transaction_index == row.transaction_index
            });
            if duplicate_index {
                return Err(violation(
                    TRANSACTIONS_HEIGHT_INDEX_KEY,
                    format!(
                        "transaction {} at height {} already exists",
                        row.transaction_index, row.block_height
                    ),
                ));
            }
            insert_unique(
                &mut self.state.transactions,
                row.id,
                row.clone(),
                &pkey("transactions"),
            )?;
        }
        Ok(())
    }

    async fn insert_tendermint_event(
        &mut self,
        row: &TendermintEventRow,
    ) -> Result<(), StoreError> {
        insert_unique(
            &mut self.state.tendermint_events,
            row.id,
            row.clone(),
            TENDERMINT_EVENTS_PKEY,
        )
    }

    async fn apply(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        let state = &mut self.state;
        match mutation {
            Mutation::CreateWallet(row) => {
                insert_unique(&mut state.wallets, row.address.clone(), row.clone(), WALLETS_PKEY)
            }
            Mutation::AddWalletVolume(delta) => {
                let wallet = require(&mut state.wallets, &delta.address, "wallet", &delta.address)?;
                wallet.total_volume = checked_total(wallet.total_volume, delta, "total volume")?;
                Ok(())
            }
            Mutation::AddWalletRewards(delta) => {
                let wallet = require(&mut state.wallets, &delta.address, "wallet", &delta.address)?;
                wallet.total_trading_rewards =
                    checked_total(wallet.total_trading_rewards, delta, "total trading rewards")?;
                Ok(())
            }
            Mutation::CreateSubaccount(row) => {
                Self::check_foreign_key(
                    state.wallets.contains_key(&row.address),
                    "subaccounts_address_fkey",
                    format!("wallet {} missing", row.address),
                )?;
                let taken = state.subaccounts.values().any(|existing| {
                    existing.address == row.address
                        && existing.subaccount_number == row.subaccount_number
                });
                if taken {
                    return Err(violation(
                        SUBACCOUNTS_ADDRESS_NUMBER_KEY,
                        format!("{}/{} exists", row.address, row.subaccount_number),
                    ));
                }
                insert_unique(&mut state.subaccounts, row.id, row.clone(), SUBACCOUNTS_PKEY)
            }
            Mutation::TouchSubaccount(touch) => {
                let subaccount = require(&mut state.subaccounts, &touch.id, "subaccount", touch.id)?;
                subaccount.updated_at = touch.updated_at;
                subaccount.updated_at_height = touch.updated_at_height;
                Ok(())
            }
            Mutation::UpsertAssetPosition(row) => {
                if row.size < Decimal::ZERO {
                    return Err(violation(
                        ASSET_POSITIONS_SIZE_CHECK,
                        format!("asset position {} would be {}", row.id, row.size),
                    ));
                }
                state.asset_positions.insert(row.id, row.clone());
                Ok(())
            }
            Mutation::CreateAsset(row) => {
                insert_unique(&mut state.assets, row.id, row.clone(), &pkey("assets"))
            }
            Mutation::CreateMarket(row) => {
                insert_unique(&mut state.markets, row.id, row.clone(), &pkey("markets"))
            }
            Mutation::UpdateMarket(row) => {
                let market = require(&mut state.markets, &row.id, "market", row.id)?;
                *market = row.clone();
                Ok(())
            }
            Mutation::UpsertLiquidityTier(row) => {
                state.liquidity_tiers.insert(row.id, row.clone());
                Ok(())
            }
            Mutation::CreatePerpetualMarket(row) => insert_unique(
                &mut state.perpetual_markets,
                row.id,
                row.clone(),
                &pkey("perpetual_markets"),
            ),
            Mutation::UpdatePerpetualMarketStatus(change) => {
                let market = require(
                    &mut state.perpetual_markets,
                    &change.id,
                    "perpetual market",
                    change.id,
                )?;
                market.status = change.status;
                Ok(())
            }
            Mutation::AppendOraclePrice(append) => insert_unique(
                &mut state.oracle_prices,
                append.price.id,
                append.price.clone(),
                &pkey("oracle_prices"),
            ),
            Mutation::PlaceOrder(row) => Self::insert_order(state, row),
            Mutation::UpdateOrderState(row) => {
                let order = require(&mut state.orders, &row.id, "order", row.id)?;
                order.total_filled = row.total_filled;
                order.status = row.status;
                order.updated_at = row.updated_at;
                order.updated_at_height = row.updated_at_height;
                order.last_event_id = row.last_event_id;
                Ok(())
            }
            Mutation::CreateFill(row) => Self::insert_fill(state, row),
            Mutation::CreatePerpetualPosition(row) => insert_unique(
                &mut state.perpetual_positions,
                row.id,
                row.clone(),
                PERPETUAL_POSITIONS_PKEY,
            ),
            Mutation::UpdatePerpetualPosition(row) => {
                let position = require(
                    &mut state.perpetual_positions,
                    &row.id,
                    "perpetual position",
                    row.id,
                )?;
                *position = row.clone();
                Ok(())
            }
            Mutation::CreateTransfer(row) => {
                insert_unique(&mut state.transfers, row.id, row.clone(), &pkey("transfers"))
            }
            Mutation::CreateTradingReward(row) => insert_unique(
                &mut state.trading_rewards,
                row.id,
                row.clone(),
                &pkey("trading_rewards"),
            ),
            Mutation::UpsertVault(row) => {
                let created_at = state
                    .vaults
                    .get(&row.address)
                    .map_or(row.created_at, |existing| existing.created_at);
                state.vaults.insert(
                    row.address.clone(),
                    VaultRow {
                        created_at,
                        ..row.clone()
                    },
                );
                Ok(())
            }
            Mutation::CreateAffiliateReferral(row) => insert_unique(
                &mut state.affiliate_referrals,
                row.referee_address.clone(),
                row.clone(),
                AFFILIATE_REFERRED_USERS_PKEY,
            ),
            Mutation::UpsertCandle(row) => {
                state.candles.insert(row.id, row.clone());
                Ok(())
            }
        }
    }

    fn reader(&mut self) -> &mut dyn StoreReader {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryUnitOfWork {
            shared,
            base_version,
            state,
        } = *self;
        let mut shared = shared.lock().await;
        if shared.failing_commits > 0 {
            shared.failing_commits -= 1;
            return Err(StoreError::Transient("injected commit failure".to_string()));
        }
        if shared.version != base_version {
            return Err(StoreError::Transient(
                "could not serialize access due to concurrent commit".to_string(),
            ));
        }
        shared.state = state;
        shared.version += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn block(height: i64) -> BlockRow {
        BlockRow {
            block_height: height,
            time: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.insert_block(&block(1)).await.unwrap();
        uow.rollback().await.unwrap();
        assert_eq!(store.last_committed_height().await.unwrap(), None);

        let mut uow = store.begin().await.unwrap();
        uow.insert_block(&block(1)).await.unwrap();
        uow.commit().await.unwrap();
        assert_eq!(store.last_committed_height().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_block_violates_primary_key() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.insert_block(&block(1)).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let error = uow.insert_block(&block(1)).await.unwrap_err();
        assert!(error.is_violation_of(BLOCKS_PKEY));
    }

    #[tokio::test]
    async fn test_concurrent_commit_is_transient() {
        let store = MemoryStore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.insert_block(&block(1)).await.unwrap();
        second.insert_block(&block(2)).await.unwrap();
        first.commit().await.unwrap();
        assert!(second.commit().await.unwrap_err().is_transient());
        assert_eq!(store.last_committed_height().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let store = MemoryStore::new();
        store.fail_next_commits(1).await;
        let mut uow = store.begin().await.unwrap();
        uow.insert_block(&block(1)).await.unwrap();
        assert!(uow.commit().await.unwrap_err().is_transient());
        assert_eq!(store.snapshot().await, MemoryState::default());
    }

    #[tokio::test]
    async fn test_subaccount_requires_wallet() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let subaccount = SubaccountRow {
            id: Uuid::from_u128(7),
            address: "dydx1alice".to_string(),
            subaccount_number: 0,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            updated_at_height: 1,
        };
        let error = uow
            .apply(&Mutation::CreateSubaccount(subaccount.clone()))
            .await
            .unwrap_err();
        assert!(error.is_violation_of("subaccounts_address_fkey"));

        uow.apply(&Mutation::CreateWallet(WalletRow::new("dydx1alice")))
            .await
            .unwrap();
        uow.apply(&Mutation::CreateSubaccount(subaccount))
            .await
            .unwrap();
        assert!(uow.find_subaccount(Uuid::from_u128(7)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_negative_asset_position_is_rejected() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let error = uow
            .apply(&Mutation::UpsertAssetPosition(AssetPositionRow {
                id: Uuid::from_u128(1),
                subaccount_id: Uuid::from_u128(2),
                asset_id: 0,
                size: Decimal::NEGATIVE_ONE,
            }))
            .await
            .unwrap_err();
        assert!(error.is_violation_of(ASSET_POSITIONS_SIZE_CHECK));
    }
}
