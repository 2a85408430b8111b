//! Event type definitions for the post-commit pipeline.
//!
//! A [`CommittedBlock`] is produced by the orchestrator once a block's unit of
//! work has committed. It carries the mutations in application order, each
//! tagged with the event that produced it. Candle updates close the block and
//! carry the position after its last event.

use pxidx_sdk::objects::EventOrdering;

use crate::entities::EventId;
use crate::mutation::Mutation;

/// One mutation together with the position of the event that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMutation {
    pub event_id: EventId,
    pub ordering: EventOrdering,
    pub event_index: u32,
    pub mutation: Mutation,
}

impl AppliedMutation {
    /// Tag a mutation derived from the block as a whole. It sorts after
    /// every event of the block.
    pub fn block_close(height: u32, mutation: Mutation) -> Self {
        Self {
            event_id: EventId::new(height, EventOrdering::EndBlock, u32::MAX),
            ordering: EventOrdering::EndBlock,
            event_index: u32::MAX,
            mutation,
        }
    }
}

/// Everything a committed block changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlock {
    pub height: u32,
    /// Mutations in application order.
    pub mutations: Vec<AppliedMutation>,
}

impl CommittedBlock {
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}
