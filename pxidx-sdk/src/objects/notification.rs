//! Outbound change notifications for the real-time fan-out collaborator.

use serde::{Deserialize, Serialize};

use super::block::EventOrdering;
use crate::signature::Signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Subaccount,
    Order,
    Market,
    PerpetualMarket,
    Wallet,
    Vault,
    Affiliate,
    Candle,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateType::Subaccount => write!(f, "subaccount"),
            AggregateType::Order => write!(f, "order"),
            AggregateType::Market => write!(f, "market"),
            AggregateType::PerpetualMarket => write!(f, "perpetual_market"),
            AggregateType::Wallet => write!(f, "wallet"),
            AggregateType::Vault => write!(f, "vault"),
            AggregateType::Affiliate => write!(f, "affiliate"),
            AggregateType::Candle => write!(f, "candle"),
        }
    }
}

/// One aggregate touched by one event.
///
/// `(block_height, ordering, event_index)` is strictly increasing across the
/// stream, so subscribers can drop anything at or below the last position
/// they have seen for an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub block_height: u32,
    pub tx_index: Option<u32>,
    pub ordering: EventOrdering,
    pub event_index: u32,
    pub payload: serde_json::Value,
}

/// All notifications produced by one committed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationBatch {
    pub block_height: u32,
    pub notifications: Vec<ChangeNotification>,
}

impl Signature for NotificationBatch {}
