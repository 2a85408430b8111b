use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use super::{BlockStore, StoreError, StoreReader, UnitOfWork};
use crate::entities::block::{BlockRow, GetLastCommittedHeight, TendermintEventRow, TransactionRow};
use crate::entities::candle::CandleRow;
use crate::entities::fill::FillRow;
use crate::entities::market::{
    AssetRow, LatestOraclePrice, ListLatestOraclePrices, LiquidityTierRow, MarketRow,
    OraclePriceRow, PerpetualMarketRow,
};
use crate::entities::order::OrderRow;
use crate::entities::position::PerpetualPositionRow;
use crate::entities::reward::{AffiliateReferralRow, TradingRewardRow};
use crate::entities::subaccount::{AssetPositionRow, SubaccountRow, WalletRow};
use crate::entities::transfer::TransferRow;
use crate::entities::vault::{ListVaultMemberAddresses, VaultRow};
use crate::framework::DatabaseProcessor;
use crate::mutation::Mutation;

pub struct PgStore {
    db: DatabaseProcessor,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            db: DatabaseProcessor { pool },
        }
    }

    pub fn processor(&self) -> &DatabaseProcessor {
        &self.db
    }
}

#[async_trait]
impl BlockStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.db.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn last_committed_height(&self) -> Result<Option<u32>, StoreError> {
        self.db
            .process(GetLastCommittedHeight)
            .await?
            .map(|height| {
                u32::try_from(height)
                    .map_err(|_| StoreError::Corrupt(format!("block height {height} out of range")))
            })
            .transpose()
    }

    async fn latest_oracle_prices(&self) -> Result<Vec<LatestOraclePrice>, StoreError> {
        Ok(self.db.process(ListLatestOraclePrices).await?)
    }

    async fn vault_member_addresses(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.db.process(ListVaultMemberAddresses).await?)
    }
}

pub struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn expect_one(rows: u64, entity: &'static str, id: impl ToString) -> Result<(), StoreError> {
    if rows == 0 {
        return Err(StoreError::not_found(entity, id));
    }
    Ok(())
}

#[async_trait]
impl StoreReader for PgUnitOfWork {
    async fn find_wallet(&mut self, address: &str) -> Result<Option<WalletRow>, StoreError> {
        Ok(WalletRow::find_tx(&mut self.tx, address).await?)
    }

    async fn find_subaccount(&mut self, id: Uuid) -> Result<Option<SubaccountRow>, StoreError> {
        Ok(SubaccountRow::find_tx(&mut self.tx, id).await?)
    }

    async fn find_asset_position(
        &mut self,
        subaccount_id: Uuid,
        asset_id: i64,
    ) -> Result<Option<AssetPositionRow>, StoreError> {
        Ok(AssetPositionRow::find_tx(&mut self.tx, subaccount_id, asset_id).await?)
    }

    async fn find_asset(&mut self, id: i64) -> Result<Option<AssetRow>, StoreError> {
        Ok(AssetRow::find_tx(&mut self.tx, id).await?)
    }

    async fn find_market(&mut self, id: i64) -> Result<Option<MarketRow>, StoreError> {
        Ok(MarketRow::find_tx(&mut self.tx, id).await?)
    }

    async fn find_liquidity_tier(
        &mut self,
        id: i64,
    ) -> Result<Option<LiquidityTierRow>, StoreError> {
        Ok(LiquidityTierRow::find_tx(&mut self.tx, id).await?)
    }

    async fn find_perpetual_market(
        &mut self,
        id: i64,
    ) -> Result<Option<PerpetualMarketRow>, StoreError> {
        Ok(PerpetualMarketRow::find_tx(&mut self.tx, id).await?)
    }

    async fn find_perpetual_market_by_clob_pair(
        &mut self,
        clob_pair_id: i64,
    ) -> Result<Option<PerpetualMarketRow>, StoreError> {
        Ok(PerpetualMarketRow::find_by_clob_pair_tx(&mut self.tx, clob_pair_id).await?)
    }

    async fn find_order(&mut self, id: Uuid) -> Result<Option<OrderRow>, StoreError> {
        Ok(OrderRow::find_tx(&mut self.tx, id).await?)
    }

    async fn find_open_position(
        &mut self,
        subaccount_id: Uuid,
        perpetual_id: i64,
    ) -> Result<Option<PerpetualPositionRow>, StoreError> {
        Ok(PerpetualPositionRow::find_open_tx(&mut self.tx, subaccount_id, perpetual_id).await?)
    }

    async fn find_vault(&mut self, address: &str) -> Result<Option<VaultRow>, StoreError> {
        Ok(VaultRow::find_tx(&mut self.tx, address).await?)
    }

    async fn find_affiliate_referral(
        &mut self,
        referee_address: &str,
    ) -> Result<Option<AffiliateReferralRow>, StoreError> {
        Ok(AffiliateReferralRow::find_tx(&mut self.tx, referee_address).await?)
    }

    #[tracing::instrument(skip_all, err, name = "SQL:ListLatestCandles")]
    async fn latest_candles(&mut self) -> Result<Vec<CandleRow>, StoreError> {
        Ok(CandleRow::list_latest_tx(&mut self.tx).await?)
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    #[tracing::instrument(skip_all, err, name = "SQL:InsertBlock", fields(height = row.block_height))]
    async fn insert_block(&mut self, row: &BlockRow) -> Result<(), StoreError> {
        Ok(BlockRow::insert_tx(&mut self.tx, row).await?)
    }

    #[tracing::instrument(skip_all, err, name = "SQL:InsertTransactions")]
    async fn insert_transactions(&mut self, rows: &[TransactionRow]) -> Result<(), StoreError> {
        TransactionRow::insert_many_tx(&mut self.tx, rows).await?;
        Ok(())
    }

    async fn insert_tendermint_event(
        &mut self,
        row: &TendermintEventRow,
    ) -> Result<(), StoreError> {
        Ok(TendermintEventRow::insert_tx(&mut self.tx, row).await?)
    }

    #[tracing::instrument(skip_all, err, name = "SQL:ApplyMutation", fields(kind = mutation.kind()))]
    async fn apply(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        let tx = &mut self.tx;
        match mutation {
            Mutation::CreateWallet(row) => WalletRow::insert_tx(tx, row).await?,
            Mutation::AddWalletVolume(delta) => expect_one(
                WalletRow::add_volume_tx(tx, &delta.address, delta.amount).await?,
                "wallet",
                &delta.address,
            )?,
            Mutation::AddWalletRewards(delta) => expect_one(
                WalletRow::add_rewards_tx(tx, &delta.address, delta.amount).await?,
                "wallet",
                &delta.address,
            )?,
            Mutation::CreateSubaccount(row) => SubaccountRow::insert_tx(tx, row).await?,
            Mutation::TouchSubaccount(touch) => expect_one(
                SubaccountRow::touch_tx(tx, touch.id, touch.updated_at, touch.updated_at_height)
                    .await?,
                "subaccount",
                touch.id,
            )?,
            Mutation::UpsertAssetPosition(row) => AssetPositionRow::upsert_tx(tx, row).await?,
            Mutation::CreateAsset(row) => AssetRow::insert_tx(tx, row).await?,
            Mutation::CreateMarket(row) => MarketRow::insert_tx(tx, row).await?,
            Mutation::UpdateMarket(row) => {
                expect_one(MarketRow::update_tx(tx, row).await?, "market", row.id)?
            }
            Mutation::UpsertLiquidityTier(row) => LiquidityTierRow::upsert_tx(tx, row).await?,
            Mutation::CreatePerpetualMarket(row) => PerpetualMarketRow::insert_tx(tx, row).await?,
            Mutation::UpdatePerpetualMarketStatus(change) => expect_one(
                PerpetualMarketRow::update_status_tx(tx, change.id, change.status).await?,
                "perpetual market",
                change.id,
            )?,
            Mutation::AppendOraclePrice(append) => {
                OraclePriceRow::insert_tx(tx, &append.price).await?
            }
            Mutation::PlaceOrder(row) => OrderRow::upsert_tx(tx, row).await?,
            Mutation::UpdateOrderState(row) => {
                expect_one(OrderRow::update_state_tx(tx, row).await?, "order", row.id)?
            }
            Mutation::CreateFill(row) => FillRow::insert_tx(tx, row).await?,
            Mutation::CreatePerpetualPosition(row) => {
                PerpetualPositionRow::insert_tx(tx, row).await?
            }
            Mutation::UpdatePerpetualPosition(row) => expect_one(
                PerpetualPositionRow::update_tx(tx, row).await?,
                "perpetual position",
                row.id,
            )?,
            Mutation::CreateTransfer(row) => TransferRow::insert_tx(tx, row).await?,
            Mutation::CreateTradingReward(row) => TradingRewardRow::insert_tx(tx, row).await?,
            Mutation::UpsertVault(row) => VaultRow::upsert_tx(tx, row).await?,
            Mutation::CreateAffiliateReferral(row) => {
                AffiliateReferralRow::insert_tx(tx, row).await?
            }
            Mutation::UpsertCandle(row) => CandleRow::upsert_tx(tx, row).await?,
        }
        Ok(())
    }

    fn reader(&mut self) -> &mut dyn StoreReader {
        self
    }

    #[tracing::instrument(skip_all, err, name = "SQL:Commit")]
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(self.tx.commit().await?)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(self.tx.rollback().await?)
    }
}
