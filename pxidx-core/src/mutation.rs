//! Entity mutations produced by handlers and applied by the orchestrator.
//!
//! Handlers never write. They return a list of [`Mutation`]s which the
//! orchestrator applies against the block's unit of work, stages into the
//! caches, and finally hands to the notifier.

use pxidx_sdk::objects::AggregateType;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entities::EventId;
use crate::entities::PerpetualMarketStatus;
use crate::entities::candle::CandleRow;
use crate::entities::fill::FillRow;
use crate::entities::market::{
    AssetRow, LiquidityTierRow, MarketRow, OraclePriceRow, PerpetualMarketRow,
};
use crate::entities::order::OrderRow;
use crate::entities::position::PerpetualPositionRow;
use crate::entities::reward::{AffiliateReferralRow, TradingRewardRow};
use crate::entities::subaccount::{AssetPositionRow, SubaccountRow, WalletRow};
use crate::entities::transfer::TransferRow;
use crate::entities::vault::VaultRow;

/// Increment of one of a wallet's aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletDelta {
    pub address: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubaccountTouch {
    pub id: Uuid,
    pub updated_at: OffsetDateTime,
    pub updated_at_height: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpetualMarketStatusChange {
    pub id: i64,
    pub status: PerpetualMarketStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OraclePriceAppend {
    #[serde(flatten)]
    pub price: OraclePriceRow,
    /// Pair of the market, carried so the oracle cache can index by ticker.
    pub pair: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateWallet(WalletRow),
    AddWalletVolume(WalletDelta),
    AddWalletRewards(WalletDelta),
    CreateSubaccount(SubaccountRow),
    TouchSubaccount(SubaccountTouch),
    UpsertAssetPosition(AssetPositionRow),
    CreateAsset(AssetRow),
    CreateMarket(MarketRow),
    UpdateMarket(MarketRow),
    UpsertLiquidityTier(LiquidityTierRow),
    CreatePerpetualMarket(PerpetualMarketRow),
    UpdatePerpetualMarketStatus(PerpetualMarketStatusChange),
    AppendOraclePrice(OraclePriceAppend),
    /// Insert or fully replace an order.
    PlaceOrder(OrderRow),
    /// Fill progress and lifecycle status of an existing order.
    UpdateOrderState(OrderRow),
    CreateFill(FillRow),
    CreatePerpetualPosition(PerpetualPositionRow),
    UpdatePerpetualPosition(PerpetualPositionRow),
    CreateTransfer(TransferRow),
    CreateTradingReward(TradingRewardRow),
    UpsertVault(VaultRow),
    CreateAffiliateReferral(AffiliateReferralRow),
    /// Insert or replace the candle of one ticker, resolution and period.
    UpsertCandle(CandleRow),
}

/// Aggregate a mutation belongs to for downstream notification.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregateKey {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
}

impl AggregateKey {
    fn new(aggregate_type: AggregateType, aggregate_id: impl ToString) -> Self {
        Self {
            aggregate_type,
            aggregate_id: aggregate_id.to_string(),
        }
    }
}

impl Mutation {
    /// Name of the mutation kind, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::CreateWallet(_) => "create_wallet",
            Mutation::AddWalletVolume(_) => "add_wallet_volume",
            Mutation::AddWalletRewards(_) => "add_wallet_rewards",
            Mutation::CreateSubaccount(_) => "create_subaccount",
            Mutation::TouchSubaccount(_) => "touch_subaccount",
            Mutation::UpsertAssetPosition(_) => "upsert_asset_position",
            Mutation::CreateAsset(_) => "create_asset",
            Mutation::CreateMarket(_) => "create_market",
            Mutation::UpdateMarket(_) => "update_market",
            Mutation::UpsertLiquidityTier(_) => "upsert_liquidity_tier",
            Mutation::CreatePerpetualMarket(_) => "create_perpetual_market",
            Mutation::UpdatePerpetualMarketStatus(_) => "update_perpetual_market_status",
            Mutation::AppendOraclePrice(_) => "append_oracle_price",
            Mutation::PlaceOrder(_) => "place_order",
            Mutation::UpdateOrderState(_) => "update_order_state",
            Mutation::CreateFill(_) => "create_fill",
            Mutation::CreatePerpetualPosition(_) => "create_perpetual_position",
            Mutation::UpdatePerpetualPosition(_) => "update_perpetual_position",
            Mutation::CreateTransfer(_) => "create_transfer",
            Mutation::CreateTradingReward(_) => "create_trading_reward",
            Mutation::UpsertVault(_) => "upsert_vault",
            Mutation::CreateAffiliateReferral(_) => "create_affiliate_referral",
            Mutation::UpsertCandle(_) => "upsert_candle",
        }
    }

    /// TendermintEvent id the written row points at, for mutations whose
    /// rows carry one.
    ///
    /// The orchestrator requires it to be the event being applied.
    pub fn event_reference(&self) -> Option<EventId> {
        match self {
            Mutation::CreateFill(fill) => Some(fill.event_id),
            Mutation::PlaceOrder(order) | Mutation::UpdateOrderState(order) => {
                Some(order.last_event_id)
            }
            Mutation::CreatePerpetualPosition(position)
            | Mutation::UpdatePerpetualPosition(position) => Some(position.last_event_id),
            Mutation::AppendOraclePrice(append) => Some(append.price.event_id),
            Mutation::CreateTransfer(transfer) => Some(transfer.event_id),
            Mutation::CreateTradingReward(reward) => Some(reward.event_id),
            _ => None,
        }
    }

    /// Aggregates this mutation changes. Empty for reference data that has
    /// no subscribers.
    pub fn aggregates(&self) -> Vec<AggregateKey> {
        use AggregateType::*;
        match self {
            Mutation::CreateWallet(wallet) => vec![AggregateKey::new(Wallet, &wallet.address)],
            Mutation::AddWalletVolume(delta) | Mutation::AddWalletRewards(delta) => {
                vec![AggregateKey::new(Wallet, &delta.address)]
            }
            Mutation::CreateSubaccount(subaccount) => {
                vec![AggregateKey::new(Subaccount, subaccount.id)]
            }
            Mutation::TouchSubaccount(touch) => vec![AggregateKey::new(Subaccount, touch.id)],
            Mutation::UpsertAssetPosition(position) => {
                vec![AggregateKey::new(Subaccount, position.subaccount_id)]
            }
            Mutation::CreateAsset(_) | Mutation::UpsertLiquidityTier(_) => vec![],
            Mutation::CreateMarket(market) | Mutation::UpdateMarket(market) => {
                vec![AggregateKey::new(Market, market.id)]
            }
            Mutation::AppendOraclePrice(append) => {
                vec![AggregateKey::new(Market, append.price.market_id)]
            }
            Mutation::CreatePerpetualMarket(perpetual) => {
                vec![AggregateKey::new(PerpetualMarket, perpetual.id)]
            }
            Mutation::UpdatePerpetualMarketStatus(change) => {
                vec![AggregateKey::new(PerpetualMarket, change.id)]
            }
            Mutation::PlaceOrder(order) | Mutation::UpdateOrderState(order) => vec![
                AggregateKey::new(Order, order.id),
                AggregateKey::new(Subaccount, order.subaccount_id),
            ],
            Mutation::CreateFill(fill) => vec![AggregateKey::new(Subaccount, fill.subaccount_id)],
            Mutation::CreatePerpetualPosition(position)
            | Mutation::UpdatePerpetualPosition(position) => {
                vec![AggregateKey::new(Subaccount, position.subaccount_id)]
            }
            Mutation::CreateTransfer(transfer) => {
                let mut keys: Vec<AggregateKey> = [
                    transfer.sender_subaccount_id,
                    transfer.recipient_subaccount_id,
                ]
                .into_iter()
                .flatten()
                .map(|id| AggregateKey::new(Subaccount, id))
                .collect();
                keys.dedup();
                keys
            }
            Mutation::CreateTradingReward(reward) => {
                vec![AggregateKey::new(Wallet, &reward.address)]
            }
            Mutation::UpsertVault(vault) => vec![AggregateKey::new(Vault, &vault.address)],
            Mutation::CreateAffiliateReferral(referral) => {
                vec![AggregateKey::new(Affiliate, &referral.affiliate_address)]
            }
            Mutation::UpsertCandle(candle) => vec![AggregateKey::new(
                Candle,
                format!("{}/{}", candle.ticker, candle.resolution),
            )],
        }
    }

    /// Key of this mutation's rows inside a notification payload.
    pub fn payload_key(&self) -> &'static str {
        match self {
            Mutation::CreateWallet(_) => "wallets",
            Mutation::AddWalletVolume(_) => "volumes",
            Mutation::AddWalletRewards(_) => "rewardTotals",
            Mutation::CreateSubaccount(_) | Mutation::TouchSubaccount(_) => "subaccounts",
            Mutation::UpsertAssetPosition(_) => "assetPositions",
            Mutation::CreateAsset(_) => "assets",
            Mutation::CreateMarket(_) | Mutation::UpdateMarket(_) => "markets",
            Mutation::UpsertLiquidityTier(_) => "liquidityTiers",
            Mutation::CreatePerpetualMarket(_) | Mutation::UpdatePerpetualMarketStatus(_) => {
                "perpetualMarkets"
            }
            Mutation::AppendOraclePrice(_) => "oraclePrices",
            Mutation::PlaceOrder(_) | Mutation::UpdateOrderState(_) => "orders",
            Mutation::CreateFill(_) => "fills",
            Mutation::CreatePerpetualPosition(_) | Mutation::UpdatePerpetualPosition(_) => {
                "perpetualPositions"
            }
            Mutation::CreateTransfer(_) => "transfers",
            Mutation::CreateTradingReward(_) => "tradingRewards",
            Mutation::UpsertVault(_) => "vaults",
            Mutation::CreateAffiliateReferral(_) => "referrals",
            Mutation::UpsertCandle(_) => "candles",
        }
    }

    /// JSON rendering of the written row.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Mutation::CreateWallet(row) => serde_json::to_value(row),
            Mutation::AddWalletVolume(delta) | Mutation::AddWalletRewards(delta) => {
                serde_json::to_value(delta)
            }
            Mutation::CreateSubaccount(row) => serde_json::to_value(row),
            Mutation::TouchSubaccount(touch) => serde_json::to_value(touch),
            Mutation::UpsertAssetPosition(row) => serde_json::to_value(row),
            Mutation::CreateAsset(row) => serde_json::to_value(row),
            Mutation::CreateMarket(row) | Mutation::UpdateMarket(row) => serde_json::to_value(row),
            Mutation::UpsertLiquidityTier(row) => serde_json::to_value(row),
            Mutation::CreatePerpetualMarket(row) => serde_json::to_value(row),
            Mutation::UpdatePerpetualMarketStatus(change) => serde_json::to_value(change),
            Mutation::AppendOraclePrice(append) => serde_json::to_value(append),
            Mutation::PlaceOrder(row) | Mutation::UpdateOrderState(row) => {
                serde_json::to_value(row)
            }
            Mutation::CreateFill(row) => serde_json::to_value(row),
            Mutation::CreatePerpetualPosition(row) | Mutation::UpdatePerpetualPosition(row) => {
                serde_json::to_value(row)
            }
            Mutation::CreateTransfer(row) => serde_json::to_value(row),
            Mutation::CreateTradingReward(row) => serde_json::to_value(row),
            Mutation::UpsertVault(row) => serde_json::to_value(row),
            Mutation::CreateAffiliateReferral(row) => serde_json::to_value(row),
            Mutation::UpsertCandle(row) => serde_json::to_value(row),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxidx_sdk::objects::EventOrdering;

    fn transfer(sender: Option<Uuid>, recipient: Option<Uuid>) -> Mutation {
        Mutation::CreateTransfer(TransferRow {
            id: Uuid::nil(),
            sender_subaccount_id: sender,
            recipient_subaccount_id: recipient,
            sender_wallet_address: None,
            recipient_wallet_address: None,
            asset_id: 0,
            size: Decimal::ONE,
            event_id: EventId::new(1, EventOrdering::Transaction(0), 0),
            transaction_hash: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            created_at_height: 1,
        })
    }

    #[test]
    fn test_transfer_notifies_both_subaccounts_once() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert_eq!(transfer(Some(a), Some(b)).aggregates().len(), 2);
        assert_eq!(transfer(Some(a), Some(a)).aggregates().len(), 1);
        assert_eq!(transfer(None, Some(b)).aggregates().len(), 1);
    }

    #[test]
    fn test_event_reference() {
        let mutation = transfer(None, None);
        assert_eq!(
            mutation.event_reference(),
            Some(EventId::new(1, EventOrdering::Transaction(0), 0))
        );
        assert_eq!(
            Mutation::CreateWallet(WalletRow::new("dydx1alice")).event_reference(),
            None
        );
    }

    #[test]
    fn test_reference_data_has_no_subscribers() {
        let asset = Mutation::CreateAsset(AssetRow {
            id: 0,
            symbol: "USDC".to_string(),
            atomic_resolution: -6,
        });
        assert!(asset.aggregates().is_empty());
        assert_eq!(asset.payload_key(), "assets");
    }
}
