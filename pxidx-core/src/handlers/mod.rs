//! Handler Registry.
//!
//! One handler per [`EventPayload`] variant, selected by an exhaustive match
//! in [`dispatch`]. Handlers read through the [`ReadContext`] and return the
//! mutations the event implies; they never write.

pub mod amount;
pub mod candle;
pub mod fill;
pub mod market;
pub mod order;
pub mod position;
pub mod reward;
pub mod subaccount;
pub mod transfer;
pub mod vault;

pub use position::{AverageCostPnl, RealizedPnl};

use std::collections::HashSet;

use pxidx_sdk::objects::events::SubaccountId;
use pxidx_sdk::objects::{EventOrdering, EventPayload};
use rust_decimal::Decimal;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::caches::CacheView;
use crate::entities::subaccount::{SubaccountRow, WalletRow};
use crate::entities::{EventId, OrderStatus, ids};
use crate::mutation::{Mutation, SubaccountTouch};
use crate::store::{StoreError, StoreReader};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{kind} {id} does not exist")]
    MissingEntity { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    DuplicateEntity { kind: &'static str, id: String },

    #[error("invalid order {order_id}: {reason}")]
    InvalidOrder { order_id: Uuid, reason: String },

    #[error("order {order_id} is not fillable in status {status:?}")]
    NotFillable { order_id: Uuid, status: OrderStatus },

    #[error("invalid {subtype} event: {reason}")]
    InvalidEvent {
        subtype: &'static str,
        reason: String,
    },

    #[error("asset {asset_id} balance of subaccount {subaccount_id} would be {balance}")]
    NegativeBalance {
        subaccount_id: Uuid,
        asset_id: i64,
        balance: Decimal,
    },

    #[error("no cached oracle price for market {market_id}")]
    CacheMiss { market_id: i64 },

    #[error("{what} overflows the decimal range")]
    Overflow { what: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        match self {
            HandlerError::Store(error) => error.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn missing(kind: &'static str, id: impl ToString) -> Self {
        HandlerError::MissingEntity {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn duplicate(kind: &'static str, id: impl ToString) -> Self {
        HandlerError::DuplicateEntity {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(subtype: &'static str, reason: impl Into<String>) -> Self {
        HandlerError::InvalidEvent {
            subtype,
            reason: reason.into(),
        }
    }
}

/// Where the event being handled sits in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub height: u32,
    pub block_time: OffsetDateTime,
    pub event_id: EventId,
    pub ordering: EventOrdering,
    pub event_index: u32,
    pub tx_hash: Option<String>,
}

impl EventContext {
    pub fn block_height(&self) -> i64 {
        i64::from(self.height)
    }
}

/// Everything a handler may read: the event position, the block's unit of
/// work, and the caches with the block's staged changes applied.
pub struct ReadContext<'a> {
    pub event: &'a EventContext,
    pub store: &'a mut dyn StoreReader,
    pub caches: CacheView<'a>,
    pub pnl: &'a dyn RealizedPnl,
}

impl ReadContext<'_> {
    pub(crate) async fn require_subaccount(
        &mut self,
        subaccount: &SubaccountId,
    ) -> Result<SubaccountRow, HandlerError> {
        let id = ids::subaccount_id(&subaccount.owner, subaccount.number);
        self.store
            .find_subaccount(id)
            .await?
            .ok_or_else(|| HandlerError::missing("subaccount", subaccount))
    }
}

/// Route an event to its handler.
pub async fn dispatch(
    payload: &EventPayload,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    match payload {
        EventPayload::StatefulOrder(event) => order::handle_stateful_order(event, ctx).await,
        EventPayload::OrderFill(event) => fill::handle_order_fill(event, ctx).await,
        EventPayload::Deleveraging(event) => fill::handle_deleveraging(event, ctx).await,
        EventPayload::Market(event) => market::handle_market(event, ctx).await,
        EventPayload::Asset(event) => market::handle_asset_create(event, ctx).await,
        EventPayload::LiquidityTier(event) => market::handle_liquidity_tier(event, ctx).await,
        EventPayload::PerpetualMarket(event) => {
            market::handle_perpetual_market_create(event, ctx).await
        }
        EventPayload::UpdateClobPair(event) => market::handle_update_clob_pair(event, ctx).await,
        EventPayload::Transfer(event) => transfer::handle_transfer(event, ctx).await,
        EventPayload::SubaccountUpdate(event) => {
            subaccount::handle_subaccount_update(event, ctx).await
        }
        EventPayload::TradingReward(event) => reward::handle_trading_reward(event, ctx).await,
        EventPayload::VaultUpsert(event) => vault::handle_vault_upsert(event, ctx).await,
        EventPayload::RegisterAffiliate(event) => {
            reward::handle_register_affiliate(event, ctx).await
        }
    }
}

/// Mutations of one event under construction.
///
/// Reads inside a handler do not see the handler's own pending mutations, so
/// wallets, subaccounts and touches created here are tracked to avoid
/// emitting them twice.
#[derive(Debug, Default)]
pub(crate) struct MutationSet {
    mutations: Vec<Mutation>,
    wallets: HashSet<String>,
    subaccounts: HashSet<Uuid>,
    touched: HashSet<Uuid>,
}

impl MutationSet {
    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub async fn ensure_wallet(
        &mut self,
        ctx: &mut ReadContext<'_>,
        address: &str,
    ) -> Result<(), HandlerError> {
        if self.wallets.contains(address) {
            return Ok(());
        }
        if ctx.store.find_wallet(address).await?.is_none() {
            self.push(Mutation::CreateWallet(WalletRow::new(address)));
        }
        self.wallets.insert(address.to_string());
        Ok(())
    }

    /// Id of the subaccount, creating it (and its wallet) when absent.
    pub async fn ensure_subaccount(
        &mut self,
        ctx: &mut ReadContext<'_>,
        subaccount: &SubaccountId,
    ) -> Result<Uuid, HandlerError> {
        let id = ids::subaccount_id(&subaccount.owner, subaccount.number);
        if self.subaccounts.contains(&id) {
            return Ok(id);
        }
        if ctx.store.find_subaccount(id).await?.is_none() {
            self.ensure_wallet(ctx, &subaccount.owner).await?;
            self.push(Mutation::CreateSubaccount(SubaccountRow {
                id,
                address: subaccount.owner.clone(),
                subaccount_number: i64::from(subaccount.number),
                updated_at: ctx.event.block_time,
                updated_at_height: ctx.event.block_height(),
            }));
        }
        self.subaccounts.insert(id);
        Ok(id)
    }

    pub fn touch_subaccount(&mut self, event: &EventContext, id: Uuid) {
        if self.touched.insert(id) {
            self.push(Mutation::TouchSubaccount(SubaccountTouch {
                id,
                updated_at: event.block_time,
                updated_at_height: event.block_height(),
            }));
        }
    }

    pub fn into_vec(self) -> Vec<Mutation> {
        self.mutations
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by handler tests.

    use super::*;
    use crate::caches::{DerivedStateCaches, StagedCacheUpdates};
    use crate::store::{BlockStore, MemoryStore, UnitOfWork};
    use pxidx_sdk::objects::events::{IndexerOrder, OrderId};
    use pxidx_sdk::objects::{OrderSide, OrderType, TimeInForce};

    pub fn event_context(height: u32, tx_index: u32, event_index: u32) -> EventContext {
        let ordering = EventOrdering::Transaction(tx_index);
        EventContext {
            height,
            block_time: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(i64::from(height)),
            event_id: EventId::new(height, ordering, event_index),
            ordering,
            event_index,
            tx_hash: Some(format!("0x{height:x}{tx_index:x}")),
        }
    }

    pub fn subaccount(owner: &str) -> SubaccountId {
        SubaccountId {
            owner: owner.to_string(),
            number: 0,
        }
    }

    pub fn order_id(owner: &str, client_id: u32) -> OrderId {
        OrderId {
            subaccount_id: subaccount(owner),
            client_id,
            order_flags: 0,
            clob_pair_id: 0,
        }
    }

    pub fn limit_order(owner: &str, client_id: u32, side: OrderSide) -> IndexerOrder {
        IndexerOrder {
            order_id: order_id(owner, client_id),
            side,
            size: Decimal::from(10),
            price: Decimal::from(20000),
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GoodTilTime,
            reduce_only: false,
            client_metadata: 0,
            good_til_block: Some(200),
            good_til_block_time: None,
        }
    }

    /// A unit of work plus caches, for driving handlers directly.
    pub struct Harness {
        pub store: MemoryStore,
        pub uow: Box<dyn UnitOfWork>,
        pub caches: DerivedStateCaches,
        pub staged: StagedCacheUpdates,
    }

    impl Harness {
        pub async fn new() -> Self {
            let store = MemoryStore::new();
            let uow = store.begin().await.unwrap();
            Self {
                store,
                uow,
                caches: DerivedStateCaches::new(),
                staged: StagedCacheUpdates::default(),
            }
        }

        /// Run a handler the way the orchestrator would, and apply what it returns.
        pub async fn run(
            &mut self,
            event: &EventContext,
            payload: &EventPayload,
        ) -> Result<Vec<Mutation>, HandlerError> {
            self.uow
                .insert_tendermint_event(&crate::entities::block::TendermintEventRow {
                    id: event.event_id,
                    block_height: event.block_height(),
                    transaction_index: event.ordering.tx_index().map(i64::from),
                    event_index: i64::from(event.event_index),
                })
                .await?;
            let mutations = {
                let mut ctx = ReadContext {
                    event,
                    store: self.uow.reader(),
                    caches: CacheView::new(&self.caches, &self.staged),
                    pnl: &AverageCostPnl,
                };
                dispatch(payload, &mut ctx).await?
            };
            for mutation in &mutations {
                self.uow.apply(mutation).await?;
                self.staged.stage(mutation);
            }
            Ok(mutations)
        }

        /// Market 0 (`BTC-USD`), tier 0, perpetual 0 on clob pair 0, asset 0 (`USDC`).
        pub async fn with_btc_market(mut self) -> Self {
            use pxidx_sdk::objects::MarketStatus;
            use pxidx_sdk::objects::events::{
                AssetCreateEvent, LiquidityTierUpsertEvent, MarketEvent,
                PerpetualMarketCreateEvent,
            };
            let setup = [
                EventPayload::Market(MarketEvent::Create {
                    market_id: 0,
                    pair: "BTC-USD".to_string(),
                    exponent: -5,
                    min_price_change_ppm: 1000,
                }),
                EventPayload::LiquidityTier(LiquidityTierUpsertEvent {
                    id: 0,
                    name: "Large-Cap".to_string(),
                    initial_margin_ppm: 50000,
                    maintenance_fraction_ppm: 600000,
                }),
                EventPayload::PerpetualMarket(PerpetualMarketCreateEvent {
                    id: 0,
                    clob_pair_id: 0,
                    ticker: "BTC-USD".to_string(),
                    market_id: 0,
                    liquidity_tier_id: 0,
                    status: MarketStatus::Active,
                }),
                EventPayload::Asset(AssetCreateEvent {
                    id: 0,
                    symbol: "USDC".to_string(),
                    atomic_resolution: -6,
                }),
            ];
            for (index, payload) in setup.iter().enumerate() {
                let event = event_context(1, 0, index as u32);
                self.run(&event, payload).await.unwrap();
            }
            self
        }
    }
}
