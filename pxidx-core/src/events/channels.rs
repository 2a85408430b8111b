//! Event channel factories and handles.

use super::types::CommittedBlock;
use tokio::sync::mpsc;

/// Default buffer size for event channels.
///
/// This provides enough buffer to handle bursts while keeping memory bounded.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Sender handle for CommittedBlock events.
pub type CommittedBlockSender = mpsc::Sender<CommittedBlock>;
/// Receiver handle for CommittedBlock events.
pub type CommittedBlockReceiver = mpsc::Receiver<CommittedBlock>;

/// Create a new CommittedBlock channel.
///
/// The orchestrator holds the sender, the notification publisher the receiver.
pub fn committed_block_channel() -> (CommittedBlockSender, CommittedBlockReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
