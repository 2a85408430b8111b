//! Typed event payloads and the closed set of supported event subtypes.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::block::RawEvent;
use super::{MarketStatus, OrderSide, OrderType, TimeInForce, VaultStatus};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubaccountId {
    pub owner: String,
    pub number: u32,
}

impl std::fmt::Display for SubaccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderId {
    pub subaccount_id: SubaccountId,
    pub client_id: u32,
    #[serde(default)]
    pub order_flags: u32,
    pub clob_pair_id: u32,
}

/// An order as carried by placement events.
///
/// Exactly one of `good_til_block` / `good_til_block_time` is expected; the
/// wire keeps both optional so the handler can reject violations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerOrder {
    pub order_id: OrderId,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub client_metadata: u32,
    #[serde(default)]
    pub good_til_block: Option<u32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub good_til_block_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemovalReason {
    UserCanceled,
    Expired,
    Undercollateralized,
    BestEffortCanceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StatefulOrderEvent {
    Placement {
        order: IndexerOrder,
    },
    ConditionalPlacement {
        order: IndexerOrder,
        trigger_price: Decimal,
    },
    ConditionalTriggered {
        order_id: OrderId,
    },
    Removal {
        order_id: OrderId,
        reason: RemovalReason,
    },
}

/// The synthetic taker side of a liquidation match. It never has an order row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationOrder {
    pub liquidated: SubaccountId,
    pub clob_pair_id: u32,
    pub perpetual_id: u32,
    pub total_size: Decimal,
    pub is_buy: bool,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FillTaker {
    Order { order_id: OrderId },
    Liquidation { order: LiquidationOrder },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFillEvent {
    pub maker_order_id: OrderId,
    pub taker: FillTaker,
    pub fill_amount: Decimal,
    #[serde(default)]
    pub maker_fee: Decimal,
    #[serde(default)]
    pub taker_fee: Decimal,
    pub total_filled_maker: Decimal,
    pub total_filled_taker: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleveragingEvent {
    pub liquidated: SubaccountId,
    pub offsetting: SubaccountId,
    pub perpetual_id: u32,
    pub fill_amount: Decimal,
    /// Absent on final settlement, which matches at the oracle price.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Whether the liquidated side buys to close.
    pub is_buy: bool,
    #[serde(default)]
    pub is_final_settlement: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MarketEvent {
    Create {
        market_id: u32,
        pair: String,
        exponent: i32,
        min_price_change_ppm: u32,
    },
    Modify {
        market_id: u32,
        pair: String,
        min_price_change_ppm: u32,
    },
    PriceUpdate {
        market_id: u32,
        price: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCreateEvent {
    pub id: u32,
    pub symbol: String,
    pub atomic_resolution: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityTierUpsertEvent {
    pub id: u32,
    pub name: String,
    pub initial_margin_ppm: u32,
    pub maintenance_fraction_ppm: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpetualMarketCreateEvent {
    pub id: u32,
    pub clob_pair_id: u32,
    pub ticker: String,
    pub market_id: u32,
    pub liquidity_tier_id: u32,
    pub status: MarketStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClobPairEvent {
    pub clob_pair_id: u32,
    pub status: MarketStatus,
}

/// One side of a transfer: a subaccount, or a bare wallet for deposits and
/// withdrawals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferParty {
    #[serde(default)]
    pub subaccount_id: Option<SubaccountId>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub sender: TransferParty,
    pub recipient: TransferParty,
    pub asset_id: u32,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset_id: u32,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingSettlement {
    pub perpetual_id: u32,
    pub settled_funding: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubaccountUpdateEvent {
    pub subaccount_id: SubaccountId,
    #[serde(default)]
    pub updated_asset_positions: Vec<AssetBalance>,
    #[serde(default)]
    pub updated_perpetual_positions: Vec<FundingSettlement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressAmount {
    pub owner: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingRewardEvent {
    pub rewards: Vec<AddressAmount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultUpsertEvent {
    pub address: String,
    pub clob_pair_id: u32,
    pub status: VaultStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAffiliateEvent {
    pub referee: String,
    pub affiliate: String,
}

/// Every event the indexer knows how to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    StatefulOrder(StatefulOrderEvent),
    OrderFill(OrderFillEvent),
    Deleveraging(DeleveragingEvent),
    Market(MarketEvent),
    Asset(AssetCreateEvent),
    LiquidityTier(LiquidityTierUpsertEvent),
    PerpetualMarket(PerpetualMarketCreateEvent),
    UpdateClobPair(UpdateClobPairEvent),
    Transfer(TransferEvent),
    SubaccountUpdate(SubaccountUpdateEvent),
    TradingReward(TradingRewardEvent),
    VaultUpsert(VaultUpsertEvent),
    RegisterAffiliate(RegisterAffiliateEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event subtype {subtype:?} (version {version})")]
    UnknownSubtype { subtype: String, version: u32 },
    #[error("malformed {subtype} payload: {source}")]
    Malformed {
        subtype: String,
        #[source]
        source: serde_json::Error,
    },
}

fn parse<T: DeserializeOwned>(event: &RawEvent) -> Result<T, DecodeError> {
    T::deserialize(&event.data).map_err(|source| DecodeError::Malformed {
        subtype: event.subtype.clone(),
        source,
    })
}

impl EventPayload {
    /// Decode a raw event into its typed payload.
    ///
    /// Only `(subtype, version)` pairs listed here are accepted; anything else
    /// is reported as [`DecodeError::UnknownSubtype`].
    pub fn decode(event: &RawEvent) -> Result<Self, DecodeError> {
        match (event.subtype.as_str(), event.version) {
            ("stateful_order", 1) => parse(event).map(Self::StatefulOrder),
            ("order_fill", 1) => parse(event).map(Self::OrderFill),
            ("deleveraging", 1) => parse(event).map(Self::Deleveraging),
            ("market", 1) => parse(event).map(Self::Market),
            ("asset", 1) => parse(event).map(Self::Asset),
            ("liquidity_tier", 1) => parse(event).map(Self::LiquidityTier),
            ("perpetual_market", 1) => parse(event).map(Self::PerpetualMarket),
            ("update_clob_pair", 1) => parse(event).map(Self::UpdateClobPair),
            ("transfer", 1) => parse(event).map(Self::Transfer),
            ("subaccount_update", 1) => parse(event).map(Self::SubaccountUpdate),
            ("trading_reward", 1) => parse(event).map(Self::TradingReward),
            ("vault_upsert", 1) => parse(event).map(Self::VaultUpsert),
            ("register_affiliate", 1) => parse(event).map(Self::RegisterAffiliate),
            (subtype, version) => Err(DecodeError::UnknownSubtype {
                subtype: subtype.to_string(),
                version,
            }),
        }
    }

    pub fn subtype(&self) -> &'static str {
        match self {
            Self::StatefulOrder(_) => "stateful_order",
            Self::OrderFill(_) => "order_fill",
            Self::Deleveraging(_) => "deleveraging",
            Self::Market(_) => "market",
            Self::Asset(_) => "asset",
            Self::LiquidityTier(_) => "liquidity_tier",
            Self::PerpetualMarket(_) => "perpetual_market",
            Self::UpdateClobPair(_) => "update_clob_pair",
            Self::Transfer(_) => "transfer",
            Self::SubaccountUpdate(_) => "subaccount_update",
            Self::TradingReward(_) => "trading_reward",
            Self::VaultUpsert(_) => "vault_upsert",
            Self::RegisterAffiliate(_) => "register_affiliate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::EventOrdering;

    fn raw(subtype: &str, version: u32, data: serde_json::Value) -> RawEvent {
        RawEvent {
            ordering: EventOrdering::Transaction(0),
            event_index: 0,
            subtype: subtype.to_string(),
            version,
            data,
        }
    }

    #[test]
    fn test_decode_order_placement() {
        let event = raw(
            "stateful_order",
            1,
            serde_json::json!({
                "kind": "placement",
                "order": {
                    "orderId": {
                        "subaccountId": {"owner": "dydx1alice", "number": 0},
                        "clientId": 7,
                        "clobPairId": 0
                    },
                    "side": "BUY",
                    "size": "10",
                    "price": "20000.5",
                    "goodTilBlock": 120
                }
            }),
        );
        let EventPayload::StatefulOrder(StatefulOrderEvent::Placement { order }) =
            EventPayload::decode(&event).unwrap()
        else {
            panic!("expected placement");
        };
        assert_eq!(order.order_id.client_id, 7);
        assert_eq!(order.order_id.order_flags, 0);
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.price, Decimal::new(200005, 1));
        assert_eq!(order.good_til_block, Some(120));
        assert!(order.good_til_block_time.is_none());
        assert_eq!(order.time_in_force, TimeInForce::GoodTilTime);
    }

    #[test]
    fn test_decode_price_update() {
        let event = raw(
            "market",
            1,
            serde_json::json!({"kind": "priceUpdate", "marketId": 3, "price": "1850.25"}),
        );
        let payload = EventPayload::decode(&event).unwrap();
        assert_eq!(payload.subtype(), "market");
        assert_eq!(
            payload,
            EventPayload::Market(MarketEvent::PriceUpdate {
                market_id: 3,
                price: Decimal::new(185025, 2),
            })
        );
    }

    #[test]
    fn test_unknown_subtype_and_version_are_rejected() {
        let unknown = raw("funding_v9", 1, serde_json::json!({}));
        assert!(matches!(
            EventPayload::decode(&unknown),
            Err(DecodeError::UnknownSubtype { .. })
        ));

        let future_version = raw("transfer", 2, serde_json::json!({}));
        assert!(matches!(
            EventPayload::decode(&future_version),
            Err(DecodeError::UnknownSubtype { version: 2, .. })
        ));
    }

    #[test]
    fn test_malformed_payload_is_a_decode_error() {
        let event = raw("transfer", 1, serde_json::json!({"assetId": "zero"}));
        assert!(matches!(
            EventPayload::decode(&event),
            Err(DecodeError::Malformed { .. })
        ));
    }
}
