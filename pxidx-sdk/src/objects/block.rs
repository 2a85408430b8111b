//! Inbound block shape as delivered by the upstream block stream.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Position of an event inside its block.
///
/// The derived ordering is the application order: every begin-block event,
/// then transaction events by index, then every end-block event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventOrdering {
    BeginBlock,
    Transaction(u32),
    EndBlock,
}

impl EventOrdering {
    /// Transaction index, if the event was emitted by a transaction.
    pub fn tx_index(&self) -> Option<u32> {
        match self {
            EventOrdering::Transaction(index) => Some(*index),
            EventOrdering::BeginBlock | EventOrdering::EndBlock => None,
        }
    }
}

impl std::fmt::Display for EventOrdering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventOrdering::BeginBlock => write!(f, "begin_block"),
            EventOrdering::Transaction(index) => write!(f, "tx:{index}"),
            EventOrdering::EndBlock => write!(f, "end_block"),
        }
    }
}

/// One undecoded event: a type tag, a payload version and an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub ordering: EventOrdering,
    pub event_index: u32,
    pub subtype: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub data: serde_json::Value,
}

fn default_version() -> u32 {
    1
}

/// A block worth of events, in whatever order the transport delivered them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub height: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default)]
    pub tx_hashes: Vec<String>,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

impl RawBlock {
    /// Hash of the transaction at `tx_index`, if the block carries one.
    pub fn tx_hash(&self, tx_index: u32) -> Option<&str> {
        self.tx_hashes.get(tx_index as usize).map(String::as_str)
    }

    /// Events sorted into application order.
    ///
    /// The sort is stable, so two events sharing a key keep transport order;
    /// callers are expected to reject such blocks.
    pub fn ordered_events(&self) -> Vec<&RawEvent> {
        let mut events: Vec<&RawEvent> = self.events.iter().collect();
        events.sort_by_key(|event| (event.ordering, event.event_index));
        events
    }
}
