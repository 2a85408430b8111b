pub mod block;
pub mod candle;
pub mod fill;
pub mod ids;
pub mod market;
pub mod order;
pub mod position;
pub mod reward;
pub mod schema;
pub mod subaccount;
pub mod transfer;
pub mod vault;

pub use ids::EventId;

use pxidx_sdk::objects::{
    MarketStatus as SdkMarketStatus, OrderSide as SdkOrderSide, OrderType as SdkOrderType,
    TimeInForce as SdkTimeInForce, VaultStatus as SdkVaultStatus,
};
use serde::Serialize;

/// Order side for database operations.
///
/// This is the sqlx::Type version. For the wire version, see `pxidx_sdk::objects::OrderSide`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "order_side")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl From<SdkOrderSide> for OrderSide {
    fn from(value: SdkOrderSide) -> Self {
        match value {
            SdkOrderSide::Buy => OrderSide::Buy,
            SdkOrderSide::Sell => OrderSide::Sell,
        }
    }
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "order_status")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
    BestEffortCanceled,
    Untriggered,
}

impl OrderStatus {
    /// Whether a fill may still be matched against an order in this status.
    pub fn is_fillable(self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::BestEffortCanceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "time_in_force")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Gtt,
    Ioc,
    PostOnly,
    Fok,
}

impl From<SdkTimeInForce> for TimeInForce {
    fn from(value: SdkTimeInForce) -> Self {
        match value {
            SdkTimeInForce::GoodTilTime => TimeInForce::Gtt,
            SdkTimeInForce::ImmediateOrCancel => TimeInForce::Ioc,
            SdkTimeInForce::PostOnly => TimeInForce::PostOnly,
            SdkTimeInForce::FillOrKill => TimeInForce::Fok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "order_type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl From<SdkOrderType> for OrderType {
    fn from(value: SdkOrderType) -> Self {
        match value {
            SdkOrderType::Limit => OrderType::Limit,
            SdkOrderType::Market => OrderType::Market,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "fill_type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillType {
    Market,
    Limit,
    Liquidated,
    Liquidation,
    Deleveraged,
    Offsetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "liquidity")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Liquidity {
    Maker,
    Taker,
}

impl std::fmt::Display for Liquidity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liquidity::Maker => write!(f, "MAKER"),
            Liquidity::Taker => write!(f, "TAKER"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "position_side")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "position_status")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "perpetual_market_status")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerpetualMarketStatus {
    Active,
    Paused,
    CancelOnly,
    PostOnly,
    Initializing,
    FinalSettlement,
}

impl From<SdkMarketStatus> for PerpetualMarketStatus {
    fn from(value: SdkMarketStatus) -> Self {
        match value {
            SdkMarketStatus::Active => PerpetualMarketStatus::Active,
            SdkMarketStatus::Paused => PerpetualMarketStatus::Paused,
            SdkMarketStatus::CancelOnly => PerpetualMarketStatus::CancelOnly,
            SdkMarketStatus::PostOnly => PerpetualMarketStatus::PostOnly,
            SdkMarketStatus::Initializing => PerpetualMarketStatus::Initializing,
            SdkMarketStatus::FinalSettlement => PerpetualMarketStatus::FinalSettlement,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE", type_name = "vault_status")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VaultStatus {
    Deactivated,
    StandBy,
    Quoting,
    CloseOnly,
}

impl From<SdkVaultStatus> for VaultStatus {
    fn from(value: SdkVaultStatus) -> Self {
        match value {
            SdkVaultStatus::Deactivated => VaultStatus::Deactivated,
            SdkVaultStatus::StandBy => VaultStatus::StandBy,
            SdkVaultStatus::Quoting => VaultStatus::Quoting,
            SdkVaultStatus::CloseOnly => VaultStatus::CloseOnly,
        }
    }
}
