//! Store seam between the engine and the relational store.
//!
//! The orchestrator only talks to a [`BlockStore`]: it opens one
//! [`UnitOfWork`] per block, reads and writes through it, and commits or
//! rolls back exactly once. [`postgres::PgStore`] is the production store,
//! [`memory::MemoryStore`] keeps the same constraint semantics in memory.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryState, MemoryStore};
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::block::{BlockRow, TendermintEventRow, TransactionRow};
use crate::entities::candle::CandleRow;
use crate::entities::market::{
    AssetRow, LatestOraclePrice, LiquidityTierRow, MarketRow, PerpetualMarketRow,
};
use crate::entities::order::OrderRow;
use crate::entities::position::PerpetualPositionRow;
use crate::entities::reward::AffiliateReferralRow;
use crate::entities::subaccount::{AssetPositionRow, SubaccountRow, WalletRow};
use crate::entities::vault::VaultRow;
use crate::mutation::Mutation;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Retrying the whole unit of work may succeed.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// An integrity constraint rejected a write.
    #[error("constraint {constraint} violated: {message}")]
    Constraint { constraint: String, message: String },

    /// An update targeted a row that does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A stored value does not fit the engine's types.
    #[error("corrupt store data: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_violation_of(&self, name: &str) -> bool {
        matches!(self, StoreError::Constraint { constraint, .. } if constraint == name)
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// SQLSTATE codes worth retrying: serialization failure and deadlock.
const TRANSIENT_SQLSTATES: [&str; 2] = ["40001", "40P01"];

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(error.to_string()),
            sqlx::Error::Database(db_error) => {
                let code = db_error.code();
                let code = code.as_deref().unwrap_or_default();
                if TRANSIENT_SQLSTATES.contains(&code) {
                    StoreError::Transient(error.to_string())
                } else if code.starts_with("23") {
                    StoreError::Constraint {
                        constraint: db_error.constraint().unwrap_or(code).to_string(),
                        message: db_error.message().to_string(),
                    }
                } else {
                    StoreError::Database(error)
                }
            }
            _ => StoreError::Database(error),
        }
    }
}

/// Transactional reads available to handlers.
#[async_trait]
pub trait StoreReader: Send {
    async fn find_wallet(&mut self, address: &str) -> Result<Option<WalletRow>, StoreError>;
    async fn find_subaccount(&mut self, id: Uuid) -> Result<Option<SubaccountRow>, StoreError>;
    async fn find_asset_position(
        &mut self,
        subaccount_id: Uuid,
        asset_id: i64,
    ) -> Result<Option<AssetPositionRow>, StoreError>;
    async fn find_asset(&mut self, id: i64) -> Result<Option<AssetRow>, StoreError>;
    async fn find_market(&mut self, id: i64) -> Result<Option<MarketRow>, StoreError>;
    async fn find_liquidity_tier(&mut self, id: i64)
    -> Result<Option<LiquidityTierRow>, StoreError>;
    async fn find_perpetual_market(
        &mut self,
        id: i64,
    ) -> Result<Option<PerpetualMarketRow>, StoreError>;
    async fn find_perpetual_market_by_clob_pair(
        &mut self,
        clob_pair_id: i64,
    ) -> Result<Option<PerpetualMarketRow>, StoreError>;
    async fn find_order(&mut self, id: Uuid) -> Result<Option<OrderRow>, StoreError>;
    async fn find_open_position(
        &mut self,
        subaccount_id: Uuid,
        perpetual_id: i64,
    ) -> Result<Option<PerpetualPositionRow>, StoreError>;
    async fn find_vault(&mut self, address: &str) -> Result<Option<VaultRow>, StoreError>;
    async fn find_affiliate_referral(
        &mut self,
        referee_address: &str,
    ) -> Result<Option<AffiliateReferralRow>, StoreError>;
    /// Most recent candle of every ticker and resolution.
    async fn latest_candles(&mut self) -> Result<Vec<CandleRow>, StoreError>;
}

/// One block's atomic unit of work. Nothing written through it is visible
/// to other readers until [`UnitOfWork::commit`].
#[async_trait]
pub trait UnitOfWork: StoreReader {
    async fn insert_block(&mut self, row: &BlockRow) -> Result<(), StoreError>;
    async fn insert_transactions(&mut self, rows: &[TransactionRow]) -> Result<(), StoreError>;
    async fn insert_tendermint_event(&mut self, row: &TendermintEventRow)
    -> Result<(), StoreError>;
    async fn apply(&mut self, mutation: &Mutation) -> Result<(), StoreError>;

    fn reader(&mut self) -> &mut dyn StoreReader;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Highest committed block height, `None` on an empty store.
    async fn last_committed_height(&self) -> Result<Option<u32>, StoreError>;

    async fn latest_oracle_prices(&self) -> Result<Vec<LatestOraclePrice>, StoreError>;

    /// Owner addresses of vaults that count as vault accounts.
    async fn vault_member_addresses(&self) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_constraint_match() {
        let error = StoreError::Constraint {
            constraint: "blocks_pkey".to_string(),
            message: "duplicate key".to_string(),
        };
        assert!(error.is_violation_of("blocks_pkey"));
        assert!(!error.is_violation_of("fills_pkey"));
        assert!(!error.is_transient());
    }
}
