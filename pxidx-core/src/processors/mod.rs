//! Processors of the ingestion pipeline.
//!
//! - `Sequencer`: Polls a `BlockSource`, hands out `RawBlock`s strictly by height
//! - `BlockProcessor`: Applies one block atomically, emits `CommittedBlock`
//! - `IngestionRunner`: Drives the two above with retry and shutdown handling
//! - `NotificationPublisher`: Receives `CommittedBlock`, delivers `NotificationBatch`

pub mod block_processor;
pub mod ingestion;
pub mod notifier;
pub mod sequencer;

pub use block_processor::{Applied, ApplyError, BlockProcessor};
pub use ingestion::{IngestionError, IngestionExit, IngestionRunner, IngestionState, IngestionStatus};
pub use notifier::{
    LogSink, NotificationPublisher, NotificationSink, NotifierError, NotifierHandle, WebhookSink,
    build_batch,
};
pub use sequencer::{
    BlockSource, ChannelBlockSource, HttpBlockSource, JsonLinesSource, Sequencer, SequencerError,
    SourcePoll,
};
