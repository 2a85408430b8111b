//! Sequencer.
//!
//! The Sequencer is responsible for:
//! - Resuming the block stream at `last committed height + 1`
//! - Polling a `BlockSource` until the next height is available
//! - Dropping redelivered heights that are already committed
//! - Refusing to skip heights
//!
//! Delivery is at-least-once. A height handed out but not committed before a
//! crash is handed out again after restart.

use std::time::Duration;

use async_trait::async_trait;
use pxidx_sdk::objects::RawBlock;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::store::{BlockStore, StoreError};

/// Errors that can occur while sequencing blocks.
#[derive(Debug, Error)]
pub enum SequencerError {
    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Block source returned an error status
    #[error("block source returned status {status}: {body}")]
    Source { status: u16, body: String },

    /// Reading the block stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A delivered block could not be parsed
    #[error("block parsing error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The source skipped heights
    #[error("expected block {expected}, source delivered {got}")]
    HeightGap { expected: u32, got: u32 },

    /// Reading the committed height failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SequencerError {
    pub fn is_transient(&self) -> bool {
        match self {
            SequencerError::Request(_) => true,
            SequencerError::Source { status, .. } => *status >= 500 || *status == 429,
            SequencerError::Store(source) => source.is_transient(),
            SequencerError::Io(_) | SequencerError::Parse(_) | SequencerError::HeightGap { .. } => {
                false
            }
        }
    }
}

/// Outcome of asking a source for one height.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Block(RawBlock),
    /// The height has not been produced yet.
    Pending,
    /// The source will never produce another block.
    EndOfStream,
}

/// Something that produces raw blocks by height.
///
/// Sources may deliver heights other than the one asked for; the sequencer
/// decides what to do with them.
#[async_trait]
pub trait BlockSource: Send {
    async fn poll(&mut self, height: u32) -> Result<SourcePoll, SequencerError>;
}

/// Polls `GET {url}/blocks/{height}`. A 404 means the height is not produced yet.
pub struct HttpBlockSource {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpBlockSource {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn block_url(&self, height: u32) -> String {
        format!(
            "{}/blocks/{height}",
            self.base_url.as_str().trim_end_matches('/')
        )
    }
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn poll(&mut self, height: u32) -> Result<SourcePoll, SequencerError> {
        let response = self.http_client.get(self.block_url(height)).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(SourcePoll::Pending);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SequencerError::Source {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.bytes().await?;
        Ok(SourcePoll::Block(serde_json::from_slice(&body)?))
    }
}

/// Reads one JSON block per line. Blank lines are skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> BlockSource for JsonLinesSource<R> {
    async fn poll(&mut self, _height: u32) -> Result<SourcePoll, SequencerError> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(SourcePoll::Block(serde_json::from_str(line)?));
        }
        Ok(SourcePoll::EndOfStream)
    }
}

/// Blocks pushed in-process, for embedding the engine.
pub struct ChannelBlockSource {
    rx: mpsc::Receiver<RawBlock>,
}

impl ChannelBlockSource {
    pub fn new(rx: mpsc::Receiver<RawBlock>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl BlockSource for ChannelBlockSource {
    async fn poll(&mut self, _height: u32) -> Result<SourcePoll, SequencerError> {
        Ok(match self.rx.recv().await {
            Some(block) => SourcePoll::Block(block),
            None => SourcePoll::EndOfStream,
        })
    }
}

/// Hands out blocks strictly by height.
pub struct Sequencer {
    source: Box<dyn BlockSource>,
    last_committed: Option<u32>,
    next_height: u32,
    poll_interval: Duration,
}

impl Sequencer {
    /// Create a sequencer positioned after the last committed block.
    ///
    /// # Arguments
    ///
    /// * `source` - Where blocks come from
    /// * `store` - Store holding the committed blocks
    /// * `start_height` - First height to ask for when nothing is committed yet
    /// * `poll_interval` - Wait between polls while the next height is pending
    pub async fn resume(
        source: Box<dyn BlockSource>,
        store: &dyn BlockStore,
        start_height: u32,
        poll_interval: Duration,
    ) -> Result<Self, SequencerError> {
        let last_committed = store.last_committed_height().await?;
        let next_height = last_committed.map_or(start_height, |height| height.saturating_add(1));
        info!(
            last_committed = ?last_committed,
            next_height, "Sequencer resuming"
        );
        Ok(Self {
            source,
            last_committed,
            next_height,
            poll_interval,
        })
    }

    pub fn last_committed(&self) -> Option<u32> {
        self.last_committed
    }

    pub fn next_height(&self) -> u32 {
        self.next_height
    }

    /// Wait for the next block. `None` once the source has ended.
    ///
    /// Cancel-safe as long as the source's `poll` is.
    pub async fn next(&mut self) -> Result<Option<RawBlock>, SequencerError> {
        loop {
            match self.source.poll(self.next_height).await? {
                SourcePoll::Block(block) if block.height < self.next_height => {
                    debug!(
                        height = block.height,
                        next_height = self.next_height,
                        "Dropping redelivered block"
                    );
                }
                SourcePoll::Block(block) if block.height > self.next_height => {
                    return Err(SequencerError::HeightGap {
                        expected: self.next_height,
                        got: block.height,
                    });
                }
                SourcePoll::Block(block) => return Ok(Some(block)),
                SourcePoll::Pending => tokio::time::sleep(self.poll_interval).await,
                SourcePoll::EndOfStream => return Ok(None),
            }
        }
    }

    /// Record that `height` is committed; the next call asks for `height + 1`.
    pub fn mark_committed(&mut self, height: u32) {
        if height >= self.next_height {
            self.next_height = height.saturating_add(1);
            self.last_committed = Some(height);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caches::DerivedStateCaches;
    use crate::processors::block_processor::testing::{block, genesis};
    use crate::processors::block_processor::BlockProcessor;
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays a fixed script of poll outcomes.
    struct ScriptedSource(VecDeque<SourcePoll>);

    #[async_trait]
    impl BlockSource for ScriptedSource {
        async fn poll(&mut self, _height: u32) -> Result<SourcePoll, SequencerError> {
            Ok(self.0.pop_front().unwrap_or(SourcePoll::EndOfStream))
        }
    }

    async fn scripted_sequencer(store: &MemoryStore, script: Vec<SourcePoll>) -> Sequencer {
        Sequencer::resume(
            Box::new(ScriptedSource(script.into())),
            store,
            1,
            Duration::from_millis(10),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_resumes_after_last_committed_height() {
        let store = MemoryStore::new();
        let processor = BlockProcessor::new(Arc::new(store.clone()), DerivedStateCaches::new());
        processor.apply(&genesis()).await.unwrap();
        processor.apply(&block(2, 0, vec![])).await.unwrap();

        let sequencer = scripted_sequencer(&store, vec![]).await;
        assert_eq!(sequencer.last_committed(), Some(2));
        assert_eq!(sequencer.next_height(), 3);

        let empty = scripted_sequencer(&MemoryStore::new(), vec![]).await;
        assert_eq!(empty.last_committed(), None);
        assert_eq!(empty.next_height(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_and_pending_heights_are_skipped() {
        let store = MemoryStore::new();
        let mut sequencer = scripted_sequencer(
            &store,
            vec![
                SourcePoll::Block(block(1, 0, vec![])),
                SourcePoll::Pending,
                SourcePoll::Block(block(1, 0, vec![])),
                SourcePoll::Block(block(2, 0, vec![])),
            ],
        )
        .await;

        let first = sequencer.next().await.unwrap().unwrap();
        assert_eq!(first.height, 1);
        sequencer.mark_committed(1);

        let second = sequencer.next().await.unwrap().unwrap();
        assert_eq!(second.height, 2);
        sequencer.mark_committed(2);

        assert!(sequencer.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_height_is_delivered_again() {
        let store = MemoryStore::new();
        let mut sequencer = scripted_sequencer(
            &store,
            vec![
                SourcePoll::Block(block(1, 0, vec![])),
                SourcePoll::Block(block(1, 0, vec![])),
            ],
        )
        .await;
        assert_eq!(sequencer.next().await.unwrap().unwrap().height, 1);
        assert_eq!(sequencer.next().await.unwrap().unwrap().height, 1);
    }

    #[tokio::test]
    async fn test_height_gap_is_fatal() {
        let store = MemoryStore::new();
        let mut sequencer =
            scripted_sequencer(&store, vec![SourcePoll::Block(block(3, 0, vec![]))]).await;
        let error = sequencer.next().await.unwrap_err();
        assert!(matches!(
            error,
            SequencerError::HeightGap {
                expected: 1,
                got: 3
            }
        ));
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn test_json_lines_source() {
        let first = serde_json::to_string(&block(1, 0, vec![])).unwrap();
        let second = serde_json::to_string(&block(2, 0, vec![])).unwrap();
        let input = format!("{first}\n\n{second}\n");
        let mut source = JsonLinesSource::new(BufReader::new(input.as_bytes()));

        assert!(matches!(source.poll(1).await.unwrap(), SourcePoll::Block(b) if b.height == 1));
        assert!(matches!(source.poll(2).await.unwrap(), SourcePoll::Block(b) if b.height == 2));
        assert_eq!(source.poll(3).await.unwrap(), SourcePoll::EndOfStream);

        let mut broken = JsonLinesSource::new(BufReader::new("{not json}\n".as_bytes()));
        assert!(matches!(
            broken.poll(1).await.unwrap_err(),
            SequencerError::Parse(_)
        ));
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = ChannelBlockSource::new(rx);
        tx.send(block(1, 0, vec![])).await.unwrap();
        drop(tx);
        assert!(matches!(source.poll(1).await.unwrap(), SourcePoll::Block(_)));
        assert_eq!(source.poll(2).await.unwrap(), SourcePoll::EndOfStream);
    }

    #[test]
    fn test_block_url_joins_cleanly() {
        let source = HttpBlockSource::new(Url::parse("http://node:26657/api/").unwrap());
        assert_eq!(source.block_url(42), "http://node:26657/api/blocks/42");
    }
}
