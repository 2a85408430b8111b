pub mod block;
pub mod events;
pub mod notification;

pub use block::{EventOrdering, RawBlock, RawEvent};
pub use events::{DecodeError, EventPayload};
pub use notification::{AggregateType, ChangeNotification, NotificationBatch};

use serde::{Deserialize, Serialize};

/// Order side.
///
/// This is the wire version without sqlx::Type.
/// For database operations, use the version in `pxidx-core::entities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeInForce {
    #[default]
    #[serde(rename = "GTT")]
    GoodTilTime,
    #[serde(rename = "IOC")]
    ImmediateOrCancel,
    #[serde(rename = "POST_ONLY")]
    PostOnly,
    #[serde(rename = "FOK")]
    FillOrKill,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    #[default]
    Limit,
    Market,
}

/// Trading status of a perpetual market (CLOB pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Active,
    Paused,
    CancelOnly,
    PostOnly,
    Initializing,
    FinalSettlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VaultStatus {
    Deactivated,
    StandBy,
    Quoting,
    CloseOnly,
}
