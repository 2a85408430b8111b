//! Block Transaction Orchestrator.
//!
//! The BlockProcessor is responsible for:
//! - Decoding and ordering one block's events before touching the store
//! - Opening one unit of work and inserting the Block, Transaction and
//!   TendermintEvent rows
//! - Running every event through the Handler Registry and applying the
//!   returned mutations in event order
//! - Rolling the block's trades into per-market candles
//! - Committing once, or rolling back everything on the first error
//! - Advancing the Derived-State Caches and handing the mutations to the
//!   Downstream Notifier after the commit

use std::collections::HashSet;
use std::sync::Arc;

use pxidx_sdk::objects::{DecodeError, EventOrdering, EventPayload, RawBlock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::caches::{CacheView, DerivedStateCaches, StagedCacheUpdates};
use crate::entities::block::{
    BLOCKS_PKEY, BlockRow, TENDERMINT_EVENTS_PKEY, TendermintEventRow, TransactionRow,
};
use crate::entities::{EventId, ids};
use crate::events::{AppliedMutation, CommittedBlock};
use crate::handlers::{
    self, AverageCostPnl, EventContext, HandlerError, ReadContext, RealizedPnl, candle,
};
use crate::mutation::Mutation;
use crate::processors::notifier::NotifierHandle;
use crate::store::{BlockStore, StoreError, UnitOfWork};

/// Why a block could not be applied. Nothing of the block is visible.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("block {height} event {position}: unknown event {subtype:?} (version {version})")]
    UnknownEvent {
        height: u32,
        position: String,
        subtype: String,
        version: u32,
    },

    #[error("block {height} event {position}: {source}")]
    MalformedEvent {
        height: u32,
        position: String,
        #[source]
        source: DecodeError,
    },

    #[error("block {height} carries event {position} more than once")]
    DuplicatePosition { height: u32, position: String },

    #[error("block {height} event {position} references transaction {tx_index} without a hash")]
    MissingTransaction {
        height: u32,
        position: String,
        tx_index: u32,
    },

    #[error("tendermint event {event_id} was already applied")]
    DuplicateEvent { event_id: EventId },

    #[error("event {event_id} produced {kind} pointing at event {referenced}")]
    ForeignEventReference {
        event_id: EventId,
        kind: &'static str,
        referenced: EventId,
    },

    #[error("block {height} event {event_id} ({subtype}): {source}")]
    Handler {
        height: u32,
        event_id: EventId,
        subtype: &'static str,
        #[source]
        source: HandlerError,
    },

    #[error("block {height} candles: {source}")]
    Candles {
        height: u32,
        #[source]
        source: HandlerError,
    },

    #[error("block {height}: {source}")]
    Store {
        height: u32,
        #[source]
        source: StoreError,
    },
}

impl ApplyError {
    /// Whether retrying the whole block from a fresh unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApplyError::Handler { source, .. } | ApplyError::Candles { source, .. } => {
                source.is_transient()
            }
            ApplyError::Store { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Outcome of a successful [`BlockProcessor::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Committed {
        height: u32,
        events: usize,
        mutations: usize,
    },
    /// The height was already committed; nothing was written.
    Duplicate { height: u32 },
}

impl Applied {
    pub fn height(&self) -> u32 {
        match self {
            Applied::Committed { height, .. } | Applied::Duplicate { height } => *height,
        }
    }
}

/// A block's events decoded and sorted into application order.
struct OrderedEvent {
    ordering: EventOrdering,
    event_index: u32,
    payload: EventPayload,
}

fn position(ordering: EventOrdering, event_index: u32) -> String {
    format!("{ordering}/{event_index}")
}

fn decode_block(block: &RawBlock) -> Result<Vec<OrderedEvent>, ApplyError> {
    let height = block.height;
    let mut seen = HashSet::new();
    let mut events = Vec::with_capacity(block.events.len());
    for raw in block.ordered_events() {
        if !seen.insert((raw.ordering, raw.event_index)) {
            return Err(ApplyError::DuplicatePosition {
                height,
                position: position(raw.ordering, raw.event_index),
            });
        }
        if let Some(tx_index) = raw.ordering.tx_index() {
            if block.tx_hash(tx_index).is_none() {
                return Err(ApplyError::MissingTransaction {
                    height,
                    position: position(raw.ordering, raw.event_index),
                    tx_index,
                });
            }
        }
        let payload = EventPayload::decode(raw).map_err(|error| match error {
            DecodeError::UnknownSubtype { subtype, version } => ApplyError::UnknownEvent {
                height,
                position: position(raw.ordering, raw.event_index),
                subtype,
                version,
            },
            source => ApplyError::MalformedEvent {
                height,
                position: position(raw.ordering, raw.event_index),
                source,
            },
        })?;
        events.push(OrderedEvent {
            ordering: raw.ordering,
            event_index: raw.event_index,
            payload,
        });
    }
    Ok(events)
}

/// Applies whole blocks atomically.
pub struct BlockProcessor {
    store: Arc<dyn BlockStore>,
    caches: DerivedStateCaches,
    pnl: Arc<dyn RealizedPnl>,
    notifier: Option<NotifierHandle>,
}

impl BlockProcessor {
    /// Create a new BlockProcessor.
    ///
    /// # Arguments
    ///
    /// * `store` - Store the blocks are committed to
    /// * `caches` - Caches advanced after every commit
    pub fn new(store: Arc<dyn BlockStore>, caches: DerivedStateCaches) -> Self {
        Self {
            store,
            caches,
            pnl: Arc::new(AverageCostPnl),
            notifier: None,
        }
    }

    pub fn with_pnl(mut self, pnl: Arc<dyn RealizedPnl>) -> Self {
        self.pnl = pnl;
        self
    }

    pub fn with_notifier(mut self, notifier: NotifierHandle) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn caches(&self) -> &DerivedStateCaches {
        &self.caches
    }

    /// Re-project both caches from committed store state.
    pub async fn refresh_caches(&self) -> Result<(), StoreError> {
        self.caches.refresh_all(self.store.as_ref()).await
    }

    /// Apply one block: commit all of it or none of it.
    #[tracing::instrument(skip_all, fields(height = block.height), err)]
    pub async fn apply(&self, block: &RawBlock) -> Result<Applied, ApplyError> {
        let height = block.height;
        let events = decode_block(block)?;
        let store_error = |source| ApplyError::Store { height, source };

        let mut uow = self.store.begin().await.map_err(store_error)?;
        let block_row = BlockRow {
            block_height: i64::from(height),
            time: block.time,
        };
        match uow.insert_block(&block_row).await {
            Ok(()) => {}
            Err(error) if error.is_violation_of(BLOCKS_PKEY) => {
                debug!(height, "Block already committed, dropping redelivery");
                rollback(uow).await;
                return Ok(Applied::Duplicate { height });
            }
            Err(error) => {
                rollback(uow).await;
                return Err(store_error(error));
            }
        }

        let mut staged = StagedCacheUpdates::default();
        let mutations = match self
            .apply_events(uow.as_mut(), block, &events, &mut staged)
            .await
        {
            Ok(mutations) => mutations,
            Err(error) => {
                rollback(uow).await;
                return Err(error);
            }
        };
        uow.commit().await.map_err(store_error)?;

        let committed = CommittedBlock { height, mutations };
        info!(
            height,
            events = events.len(),
            mutations = committed.mutations.len(),
            "Block committed"
        );
        let applied = Applied::Committed {
            height,
            events: events.len(),
            mutations: committed.mutations.len(),
        };
        self.caches.apply_committed(staged).await;
        if let Some(notifier) = &self.notifier {
            notifier.publish(committed);
        }
        Ok(applied)
    }

    async fn apply_events(
        &self,
        uow: &mut dyn UnitOfWork,
        block: &RawBlock,
        events: &[OrderedEvent],
        staged: &mut StagedCacheUpdates,
    ) -> Result<Vec<AppliedMutation>, ApplyError> {
        let height = block.height;
        let store_error = |source| ApplyError::Store { height, source };

        let transactions: Vec<TransactionRow> = block
            .tx_hashes
            .iter()
            .zip(0u32..)
            .map(|(hash, tx_index)| TransactionRow {
                id: ids::transaction_id(height, tx_index),
                block_height: i64::from(height),
                transaction_index: i64::from(tx_index),
                transaction_hash: hash.clone(),
            })
            .collect();
        if !transactions.is_empty() {
            uow.insert_transactions(&transactions)
                .await
                .map_err(store_error)?;
        }

        let mut applied = Vec::new();
        for event in events {
            let event_id = EventId::new(height, event.ordering, event.event_index);
            let tx_index = event.ordering.tx_index();
            let row = TendermintEventRow {
                id: event_id,
                block_height: i64::from(height),
                transaction_index: tx_index.map(i64::from),
                event_index: i64::from(event.event_index),
            };
            uow.insert_tendermint_event(&row)
                .await
                .map_err(|error| {
                    if error.is_violation_of(TENDERMINT_EVENTS_PKEY) {
                        ApplyError::DuplicateEvent { event_id }
                    } else {
                        store_error(error)
                    }
                })?;

            let context = EventContext {
                height,
                block_time: block.time,
                event_id,
                ordering: event.ordering,
                event_index: event.event_index,
                tx_hash: tx_index
                    .and_then(|index| block.tx_hash(index))
                    .map(str::to_string),
            };
            let subtype = event.payload.subtype();
            let mutations = {
                let mut ctx = ReadContext {
                    event: &context,
                    store: uow.reader(),
                    caches: CacheView::new(&self.caches, staged),
                    pnl: self.pnl.as_ref(),
                };
                handlers::dispatch(&event.payload, &mut ctx)
                    .await
                    .map_err(|source| ApplyError::Handler {
                        height,
                        event_id,
                        subtype,
                        source,
                    })?
            };
            debug!(
                height,
                tx_index,
                event_index = event.event_index,
                subtype,
                mutations = mutations.len(),
                "Event handled"
            );

            for mutation in mutations {
                if let Some(referenced) = mutation.event_reference() {
                    if referenced != event_id {
                        return Err(ApplyError::ForeignEventReference {
                            event_id,
                            kind: mutation.kind(),
                            referenced,
                        });
                    }
                }
                uow.apply(&mutation).await.map_err(store_error)?;
                staged.stage(&mutation);
                applied.push(AppliedMutation {
                    event_id,
                    ordering: event.ordering,
                    event_index: event.event_index,
                    mutation,
                });
            }
        }

        let fills: Vec<_> = applied
            .iter()
            .filter_map(|applied| match &applied.mutation {
                Mutation::CreateFill(fill) => Some(fill),
                _ => None,
            })
            .collect();
        let candles = candle::block_candles(uow.reader(), height, block.time, &fills)
            .await
            .map_err(|source| ApplyError::Candles { height, source })?;
        debug!(height, candles = candles.len(), "Candles rolled");
        for row in candles {
            let mutation = Mutation::UpsertCandle(row);
            uow.apply(&mutation).await.map_err(store_error)?;
            applied.push(AppliedMutation::block_close(height, mutation));
        }
        Ok(applied)
    }
}

async fn rollback(uow: Box<dyn UnitOfWork>) {
    if let Err(error) = uow.rollback().await {
        warn!(error = %error, "Rollback failed; the transaction is discarded anyway");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Block fixtures shared by engine-level tests.

    use pxidx_sdk::objects::{EventOrdering, RawBlock, RawEvent};
    use serde_json::json;
    use time::OffsetDateTime;

    pub fn block_time(height: u32) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(i64::from(height))
    }

    pub fn raw_event(
        ordering: EventOrdering,
        event_index: u32,
        subtype: &str,
        data: serde_json::Value,
    ) -> RawEvent {
        RawEvent {
            ordering,
            event_index,
            subtype: subtype.to_string(),
            version: 1,
            data,
        }
    }

    pub fn block(height: u32, tx_count: u32, events: Vec<RawEvent>) -> RawBlock {
        RawBlock {
            height,
            time: block_time(height),
            tx_hashes: (0..tx_count).map(|index| format!("{height:08x}{index:04x}")).collect(),
            events,
        }
    }

    /// Market 0 `BTC-USD`, tier 0, perpetual 0 on clob pair 0 and asset 0.
    pub fn genesis() -> RawBlock {
        block(
            1,
            0,
            vec![
                raw_event(
                    EventOrdering::BeginBlock,
                    0,
                    "market",
                    json!({"kind": "create", "marketId": 0, "pair": "BTC-USD", "exponent": -5, "minPriceChangePpm": 1000}),
                ),
                raw_event(
                    EventOrdering::BeginBlock,
                    1,
                    "liquidity_tier",
                    json!({"id": 0, "name": "Large-Cap", "initialMarginPpm": 50000, "maintenanceFractionPpm": 600000}),
                ),
                raw_event(
                    EventOrdering::BeginBlock,
                    2,
                    "perpetual_market",
                    json!({"id": 0, "clobPairId": 0, "ticker": "BTC-USD", "marketId": 0, "liquidityTierId": 0, "status": "ACTIVE"}),
                ),
                raw_event(
                    EventOrdering::BeginBlock,
                    3,
                    "asset",
                    json!({"id": 0, "symbol": "USDC", "atomicResolution": -6}),
                ),
            ],
        )
    }

    pub fn order_id(owner: &str, client_id: u32) -> serde_json::Value {
        json!({
            "subaccountId": {"owner": owner, "number": 0},
            "clientId": client_id,
            "clobPairId": 0
        })
    }

    pub fn placement(owner: &str, client_id: u32, side: &str) -> serde_json::Value {
        json!({
            "kind": "placement",
            "order": {
                "orderId": order_id(owner, client_id),
                "side": side,
                "size": "10",
                "price": "20000",
                "goodTilBlock": 500
            }
        })
    }

    pub fn fill(amount: u32, total_maker: u32, total_taker: u32) -> serde_json::Value {
        json!({
            "makerOrderId": order_id("dydx1maker", 1),
            "taker": {"kind": "order", "orderId": order_id("dydx1taker", 2)},
            "fillAmount": amount.to_string(),
            "makerFee": "0",
            "takerFee": "1",
            "totalFilledMaker": total_maker.to_string(),
            "totalFilledTaker": total_taker.to_string()
        })
    }

    /// Block 100: two placements in transaction 0, a fill in transaction 1.
    pub fn trading_block() -> RawBlock {
        block(
            100,
            2,
            vec![
                raw_event(
                    EventOrdering::Transaction(1),
                    0,
                    "order_fill",
                    fill(4, 4, 4),
                ),
                raw_event(
                    EventOrdering::Transaction(0),
                    0,
                    "stateful_order",
                    placement("dydx1maker", 1, "SELL"),
                ),
                raw_event(
                    EventOrdering::Transaction(0),
                    1,
                    "stateful_order",
                    placement("dydx1taker", 2, "BUY"),
                ),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::entities::candle::{CandleResolution, CandleRow};
    use crate::entities::{OrderStatus, PositionSide};
    use crate::events::committed_block_channel;
    use crate::processors::notifier::build_batch;
    use pxidx_sdk::objects::AggregateType;
    use crate::handlers::order::order_uuid;
    use crate::store::{MemoryState, MemoryStore};
    use pxidx_sdk::objects::events::{OrderId, SubaccountId};
    use rust_decimal::Decimal;
    use serde_json::json;

    fn processor(store: &MemoryStore) -> BlockProcessor {
        BlockProcessor::new(Arc::new(store.clone()), DerivedStateCaches::new())
    }

    fn maker_order_id() -> uuid::Uuid {
        order_uuid(&OrderId {
            subaccount_id: SubaccountId {
                owner: "dydx1maker".to_string(),
                number: 0,
            },
            client_id: 1,
            order_flags: 0,
            clob_pair_id: 0,
        })
    }

    async fn applied_state(blocks: &[RawBlock]) -> MemoryState {
        let store = MemoryStore::new();
        let processor = processor(&store);
        for block in blocks {
            processor.apply(block).await.unwrap();
        }
        store.snapshot().await
    }

    #[tokio::test]
    async fn test_order_and_fill_in_one_block() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        let applied = processor.apply(&trading_block()).await.unwrap();
        assert!(matches!(applied, Applied::Committed { height: 100, events: 3, .. }));

        let state = store.snapshot().await;
        let maker = &state.orders[&maker_order_id()];
        assert_eq!(maker.total_filled, Decimal::from(4));
        assert_eq!(maker.status, OrderStatus::Open);

        let fill_event = EventId::new(100, EventOrdering::Transaction(1), 0);
        assert_eq!(state.fills.len(), 2);
        assert!(state.fills.values().all(|fill| fill.event_id == fill_event));
        assert!(state.tendermint_events.contains_key(&fill_event));
        assert_eq!(state.transactions.len(), 2);
        assert!(
            state
                .perpetual_positions
                .values()
                .any(|position| position.side == PositionSide::Long
                    && position.size == Decimal::from(4))
        );
    }

    #[tokio::test]
    async fn test_replayed_block_is_dropped() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        processor.apply(&trading_block()).await.unwrap();
        let once = store.snapshot().await;

        let replay = processor.apply(&trading_block()).await.unwrap();
        assert_eq!(replay, Applied::Duplicate { height: 100 });
        assert_eq!(store.snapshot().await, once);
    }

    #[tokio::test]
    async fn test_replay_after_crash_before_commit_matches_single_application() {
        let expected = applied_state(&[genesis(), trading_block()]).await;

        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        store.fail_next_commits(1).await;
        let error = processor.apply(&trading_block()).await.unwrap_err();
        assert!(error.is_transient());
        assert_eq!(store.snapshot().await.blocks.len(), 1);

        processor.apply(&trading_block()).await.unwrap();
        assert_eq!(store.snapshot().await, expected);
    }

    #[tokio::test]
    async fn test_unknown_event_leaves_nothing_visible() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        let before = store.snapshot().await;

        let mut block = trading_block();
        block.events.push(raw_event(
            EventOrdering::EndBlock,
            0,
            "funding_rate_v2",
            json!({}),
        ));
        let error = processor.apply(&block).await.unwrap_err();
        assert!(matches!(error, ApplyError::UnknownEvent { .. }));
        assert!(!error.is_transient());
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_handler_failure_rolls_back_earlier_events() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        let before = store.snapshot().await;

        // The fill overfills the maker, after both placements succeeded.
        let mut block = trading_block();
        block.events[0].data = fill(4, 11, 4);
        let error = processor.apply(&block).await.unwrap_err();
        assert!(matches!(
            error,
            ApplyError::Handler {
                source: HandlerError::InvalidEvent { .. },
                ..
            }
        ));
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_fill_before_its_order_is_a_missing_dependency() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();

        let mut block = trading_block();
        block.events[0].ordering = EventOrdering::BeginBlock;
        let error = processor.apply(&block).await.unwrap_err();
        assert!(matches!(
            error,
            ApplyError::Handler {
                source: HandlerError::MissingEntity { kind: "order", .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_independent_events_commute() {
        let deposit = |owner: &str| {
            json!({
                "sender": {"address": "noble1bridge"},
                "recipient": {"subaccountId": {"owner": owner, "number": 0}},
                "assetId": 0,
                "amount": "250"
            })
        };
        let forward = block(
            2,
            2,
            vec![
                raw_event(EventOrdering::Transaction(0), 0, "transfer", deposit("dydx1alice")),
                raw_event(EventOrdering::Transaction(1), 0, "transfer", deposit("dydx1bob")),
            ],
        );
        let mut reversed = forward.clone();
        reversed.events[0].data = deposit("dydx1bob");
        reversed.events[1].data = deposit("dydx1alice");

        let mut left = applied_state(&[genesis(), forward]).await;
        let mut right = applied_state(&[genesis(), reversed]).await;
        // Transfer rows are keyed by event and legitimately name different
        // parties; compare everything that is not event-keyed.
        assert_eq!(left.transfers.len(), right.transfers.len());
        left.transfers.clear();
        right.transfers.clear();
        assert_eq!(left.asset_positions, right.asset_positions);
        assert_eq!(left.subaccounts, right.subaccounts);
        assert_eq!(left.wallets, right.wallets);
    }

    #[tokio::test]
    async fn test_duplicated_event_position_is_rejected() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        let mut block = trading_block();
        block.events[2].event_index = 0;
        let error = processor.apply(&block).await.unwrap_err();
        assert!(matches!(error, ApplyError::DuplicatePosition { .. }));
    }

    #[tokio::test]
    async fn test_transaction_event_without_hash_is_rejected() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        let mut block = trading_block();
        block.tx_hashes.truncate(1);
        let error = processor.apply(&block).await.unwrap_err();
        assert!(matches!(
            error,
            ApplyError::MissingTransaction { tx_index: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_committed_price_reaches_cache_for_next_block() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        processor.apply(&trading_block()).await.unwrap();

        let price_block = block(
            101,
            0,
            vec![raw_event(
                EventOrdering::BeginBlock,
                0,
                "market",
                json!({"kind": "priceUpdate", "marketId": 0, "price": "26000"}),
            )],
        );
        processor.apply(&price_block).await.unwrap();
        assert_eq!(
            processor.caches().reader().oracle_price("BTC-USD").await,
            Some(Decimal::from(26000))
        );

        let settlement = block(
            102,
            0,
            vec![raw_event(
                EventOrdering::EndBlock,
                0,
                "deleveraging",
                json!({
                    "liquidated": {"owner": "dydx1taker", "number": 0},
                    "offsetting": {"owner": "dydx1maker", "number": 0},
                    "perpetualId": 0,
                    "fillAmount": "4",
                    "isBuy": false,
                    "isFinalSettlement": true
                }),
            )],
        );
        processor.apply(&settlement).await.unwrap();
        let state = store.snapshot().await;
        let settled: Vec<_> = state
            .fills
            .values()
            .filter(|fill| fill.created_at_height == 102)
            .map(|fill| fill.price)
            .collect();
        assert_eq!(settled, vec![Decimal::from(26000); 2]);
        assert!(
            state
                .perpetual_positions
                .values()
                .all(|position| position.size.is_zero())
        );
    }

    #[tokio::test]
    async fn test_failed_block_does_not_advance_caches() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        let failing = block(
            2,
            0,
            vec![
                raw_event(
                    EventOrdering::BeginBlock,
                    0,
                    "market",
                    json!({"kind": "priceUpdate", "marketId": 0, "price": "30000"}),
                ),
                raw_event(
                    EventOrdering::BeginBlock,
                    1,
                    "market",
                    json!({"kind": "priceUpdate", "marketId": 9, "price": "1"}),
                ),
            ],
        );
        processor.apply(&failing).await.unwrap_err();
        assert_eq!(processor.caches().reader().market_count().await, 0);
    }

    fn candle(state: &MemoryState, resolution: CandleResolution, started_at: i64) -> &CandleRow {
        state
            .candles
            .values()
            .find(|candle| {
                candle.ticker == "BTC-USD"
                    && candle.resolution == resolution
                    && candle.started_at.unix_timestamp() == started_at
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_trades_roll_into_candles_per_resolution() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        assert!(store.snapshot().await.candles.is_empty());

        // Block 100 is at 100s: minute 60s, five minutes and longer at 0s.
        processor.apply(&trading_block()).await.unwrap();
        let state = store.snapshot().await;
        assert_eq!(state.candles.len(), CandleResolution::ALL.len());
        let minute = candle(&state, CandleResolution::OneMinute, 60);
        assert_eq!(minute.open, Decimal::from(20000));
        assert_eq!(minute.close, Decimal::from(20000));
        assert_eq!(minute.base_token_volume, Decimal::from(4));
        assert_eq!(minute.usd_volume, Decimal::from(80000));
        assert_eq!(minute.trades, 1);
        assert_eq!(candle(&state, CandleResolution::OneDay, 0).trades, 1);

        // A quiet block in the next minute opens a flat one-minute candle.
        processor.apply(&block(130, 0, vec![])).await.unwrap();
        let state = store.snapshot().await;
        assert_eq!(state.candles.len(), CandleResolution::ALL.len() + 1);
        let flat = candle(&state, CandleResolution::OneMinute, 120);
        for price in [flat.open, flat.high, flat.low, flat.close] {
            assert_eq!(price, Decimal::from(20000));
        }
        assert_eq!(flat.trades, 0);
        assert_eq!(flat.base_token_volume, Decimal::ZERO);

        let more = block(
            131,
            2,
            vec![raw_event(EventOrdering::Transaction(1), 0, "order_fill", fill(3, 7, 7))],
        );
        processor.apply(&more).await.unwrap();
        let state = store.snapshot().await;
        assert_eq!(state.candles.len(), CandleResolution::ALL.len() + 1);
        let minute = candle(&state, CandleResolution::OneMinute, 120);
        assert_eq!(minute.trades, 1);
        assert_eq!(minute.base_token_volume, Decimal::from(3));
        let five = candle(&state, CandleResolution::FiveMinutes, 0);
        assert_eq!(five.trades, 2);
        assert_eq!(five.base_token_volume, Decimal::from(7));
        assert_eq!(five.usd_volume, Decimal::from(140000));
        assert_eq!(five.updated_at_height, 131);
        assert_eq!(candle(&state, CandleResolution::OneMinute, 60).trades, 1);
    }

    #[tokio::test]
    async fn test_candles_close_the_committed_block() {
        let store = MemoryStore::new();
        let (block_tx, mut block_rx) = committed_block_channel();
        let processor = processor(&store).with_notifier(NotifierHandle::new(block_tx));
        processor.apply(&genesis()).await.unwrap();
        processor.apply(&trading_block()).await.unwrap();

        block_rx.recv().await.unwrap();
        let committed = block_rx.recv().await.unwrap();
        let last = committed.mutations.last().unwrap();
        assert!(matches!(last.mutation, Mutation::UpsertCandle(_)));
        assert_eq!(last.ordering, EventOrdering::EndBlock);

        let batch = build_batch(&committed).unwrap();
        let candles: Vec<_> = batch
            .notifications
            .iter()
            .filter(|notification| notification.aggregate_type == AggregateType::Candle)
            .map(|notification| notification.aggregate_id.as_str())
            .collect();
        assert_eq!(candles.len(), CandleResolution::ALL.len());
        assert!(candles.contains(&"BTC-USD/1MIN"));
    }

    #[tokio::test]
    async fn test_amount_overflow_is_fatal_and_rolls_back() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        let before = store.snapshot().await;

        let huge = "100000000000000000000";
        let large_placement = |owner: &str, client_id: u32, side: &str| {
            let mut order = placement(owner, client_id, side);
            order["order"]["size"] = json!(huge);
            order["order"]["price"] = json!("10000000000");
            order
        };
        let mut large_fill = fill(0, 0, 0);
        for field in ["fillAmount", "totalFilledMaker", "totalFilledTaker"] {
            large_fill[field] = json!(huge);
        }
        let mut block = trading_block();
        block.events[0].data = large_fill;
        block.events[1].data = large_placement("dydx1maker", 1, "SELL");
        block.events[2].data = large_placement("dydx1taker", 2, "BUY");

        let error = processor.apply(&block).await.unwrap_err();
        assert!(matches!(
            error,
            ApplyError::Handler {
                source: HandlerError::Overflow { .. },
                ..
            }
        ));
        assert!(!error.is_transient());
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_negative_balance_is_fatal() {
        let store = MemoryStore::new();
        let processor = processor(&store);
        processor.apply(&genesis()).await.unwrap();
        let update = block(
            2,
            1,
            vec![raw_event(
                EventOrdering::Transaction(0),
                0,
                "subaccount_update",
                json!({
                    "subaccountId": {"owner": "dydx1alice", "number": 0},
                    "updatedAssetPositions": [{"assetId": 0, "size": "-5"}]
                }),
            )],
        );
        let error = processor.apply(&update).await.unwrap_err();
        assert!(matches!(
            error,
            ApplyError::Handler {
                source: HandlerError::NegativeBalance { .. },
                ..
            }
        ));
        assert!(!error.is_transient());
    }
}
