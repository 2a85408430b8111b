//! Event system for the post-commit pipeline.
//!
//! # Event Flow
//!
//! 1. `Sequencer` hands a `RawBlock` -> `BlockProcessor`
//! 2. `BlockProcessor` commits and emits `CommittedBlock` -> `NotificationPublisher`
//! 3. `NotificationPublisher` builds a `NotificationBatch` and delivers it to its sink
//!
//! Committed blocks are never re-applied because of a failure further down
//! this flow.

pub mod channels;
pub mod types;

pub use channels::{
    CommittedBlockReceiver, CommittedBlockSender, DEFAULT_CHANNEL_BUFFER, committed_block_channel,
};

pub use types::{AppliedMutation, CommittedBlock};
