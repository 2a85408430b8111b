//! Identities: the per-event idempotency key and deterministic row ids.
//!
//! Every row id is a UUIDv5 over data that is fixed by the block stream, so a
//! replayed block converges onto the same rows instead of creating new ones.

use pxidx_sdk::objects::EventOrdering;
use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::candle::CandleResolution;
use super::{Liquidity, PositionSide};

/// Namespace for every deterministic id minted by the indexer.
pub const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4e_9a3b_4f7e_8d21_5c0b_e4a9_7f13);

/// Composite `(height, slot, event_index)` key of one applied event.
///
/// Encoded as 12 big-endian bytes so that byte order equals application
/// order. The slot is 0 for begin-block events, `tx_index + 1` for
/// transaction events and `u32::MAX` for end-block events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct EventId(pub [u8; 12]);

impl EventId {
    pub fn new(height: u32, ordering: EventOrdering, event_index: u32) -> Self {
        let slot = match ordering {
            EventOrdering::BeginBlock => 0,
            EventOrdering::Transaction(index) => index.saturating_add(1),
            EventOrdering::EndBlock => u32::MAX,
        };
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&height.to_be_bytes());
        bytes[4..8].copy_from_slice(&slot.to_be_bytes());
        bytes[8..].copy_from_slice(&event_index.to_be_bytes());
        Self(bytes)
    }

    pub fn height(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Lowercase hex of the 12 id bytes.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

fn derive(parts: &[&str]) -> Uuid {
    Uuid::new_v5(&ID_NAMESPACE, parts.join("|").as_bytes())
}

pub fn subaccount_id(address: &str, subaccount_number: u32) -> Uuid {
    derive(&["subaccount", address, &subaccount_number.to_string()])
}

pub fn order_id(subaccount_id: Uuid, client_id: u32, clob_pair_id: u32, order_flags: u32) -> Uuid {
    derive(&[
        "order",
        &subaccount_id.to_string(),
        &client_id.to_string(),
        &clob_pair_id.to_string(),
        &order_flags.to_string(),
    ])
}

pub fn fill_id(event_id: &EventId, liquidity: Liquidity) -> Uuid {
    derive(&["fill", &event_id.to_hex(), &liquidity.to_string()])
}

pub fn perpetual_position_id(
    subaccount_id: Uuid,
    perpetual_id: i64,
    open_event_id: &EventId,
    side: PositionSide,
) -> Uuid {
    derive(&[
        "perpetual_position",
        &subaccount_id.to_string(),
        &perpetual_id.to_string(),
        &open_event_id.to_hex(),
        &side.to_string(),
    ])
}

pub fn asset_position_id(subaccount_id: Uuid, asset_id: i64) -> Uuid {
    derive(&[
        "asset_position",
        &subaccount_id.to_string(),
        &asset_id.to_string(),
    ])
}

pub fn transfer_id(event_id: &EventId) -> Uuid {
    derive(&["transfer", &event_id.to_hex()])
}

pub fn oracle_price_id(event_id: &EventId) -> Uuid {
    derive(&["oracle_price", &event_id.to_hex()])
}

pub fn transaction_id(height: u32, tx_index: u32) -> Uuid {
    derive(&["transaction", &height.to_string(), &tx_index.to_string()])
}

pub fn trading_reward_id(event_id: &EventId, position: usize) -> Uuid {
    derive(&["trading_reward", &event_id.to_hex(), &position.to_string()])
}

/// One candle per ticker, resolution and period start.
pub fn candle_id(ticker: &str, resolution: CandleResolution, started_at_unix: i64) -> Uuid {
    derive(&[
        "candle",
        ticker,
        resolution.as_str(),
        &started_at_unix.to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_byte_order_matches_application_order() {
        let ids = [
            EventId::new(99, EventOrdering::EndBlock, 3),
            EventId::new(100, EventOrdering::BeginBlock, 0),
            EventId::new(100, EventOrdering::BeginBlock, 1),
            EventId::new(100, EventOrdering::Transaction(0), 0),
            EventId::new(100, EventOrdering::Transaction(0), 5),
            EventId::new(100, EventOrdering::Transaction(1), 0),
            EventId::new(100, EventOrdering::EndBlock, 0),
            EventId::new(101, EventOrdering::BeginBlock, 0),
        ];
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(ids[3].height(), 100);
    }

    #[test]
    fn test_event_id_hex() {
        let id = EventId::new(1, EventOrdering::Transaction(0), 2);
        assert_eq!(id.to_hex(), "000000010000000100000002");
        assert_eq!(
            serde_json::to_value(id).unwrap(),
            serde_json::json!("000000010000000100000002")
        );

        let end = EventId::new(0x0a0b0c0d, EventOrdering::EndBlock, 255);
        assert_eq!(end.to_string(), "0a0b0c0dffffffff000000ff");
        assert_eq!(format!("{end}"), end.to_hex());
    }

    #[test]
    fn test_ids_are_deterministic_and_distinct() {
        let a = subaccount_id("dydx1alice", 0);
        assert_eq!(a, subaccount_id("dydx1alice", 0));
        assert_ne!(a, subaccount_id("dydx1alice", 1));

        let event = EventId::new(5, EventOrdering::Transaction(0), 0);
        assert_ne!(
            fill_id(&event, Liquidity::Maker),
            fill_id(&event, Liquidity::Taker)
        );
        assert_ne!(
            perpetual_position_id(a, 0, &event, PositionSide::Long),
            perpetual_position_id(a, 0, &event, PositionSide::Short)
        );
    }
}
