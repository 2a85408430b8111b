//! Ingestion runner.
//!
//! The IngestionRunner is responsible for:
//! - Pulling blocks from the `Sequencer` one at a time
//! - Applying each through the `BlockProcessor`
//! - Retrying a whole block after a transient failure, with the caches
//!   re-projected from the store before every retry
//! - Halting on anything that is not transient
//! - Honoring shutdown only between blocks
//!
//! Progress is published on a `watch` channel for the status endpoint.

use pxidx_sdk::objects::RawBlock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::block_processor::{Applied, ApplyError, BlockProcessor};
use super::sequencer::{Sequencer, SequencerError};
use crate::utils::backoff::RetryPolicy;

/// Errors that stop ingestion.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// A block failed with a non-transient error
    #[error("block {height} failed: {source}")]
    Fatal {
        height: u32,
        #[source]
        source: ApplyError,
    },

    /// A block kept failing transiently
    #[error("block {height} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        height: u32,
        attempts: u32,
        #[source]
        source: ApplyError,
    },

    /// The block stream failed
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IngestionState {
    Running,
    Retrying { height: u32, attempt: u32 },
    Halted { reason: String },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatus {
    pub last_committed_height: Option<u32>,
    #[serde(flatten)]
    pub state: IngestionState,
}

/// Why [`IngestionRunner::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionExit {
    Shutdown,
    EndOfStream,
}

/// Drives blocks from the sequencer through the orchestrator.
pub struct IngestionRunner {
    sequencer: Sequencer,
    processor: BlockProcessor,
    policy: RetryPolicy,
    shutdown_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<IngestionStatus>,
}

impl IngestionRunner {
    /// Create a new IngestionRunner.
    ///
    /// # Arguments
    ///
    /// * `sequencer` - Source of blocks, already resumed
    /// * `processor` - Orchestrator that applies each block
    /// * `policy` - Bounded retry for transient failures
    /// * `shutdown_rx` - Receiver for shutdown signal
    pub fn new(
        sequencer: Sequencer,
        processor: BlockProcessor,
        policy: RetryPolicy,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (status_tx, _) = watch::channel(IngestionStatus {
            last_committed_height: sequencer.last_committed(),
            state: IngestionState::Running,
        });
        Self {
            sequencer,
            processor,
            policy,
            shutdown_rx,
            status_tx,
        }
    }

    /// Subscribe to progress updates.
    pub fn status(&self) -> watch::Receiver<IngestionStatus> {
        self.status_tx.subscribe()
    }

    /// Run until shutdown, end of stream, or a fatal error.
    pub async fn run(mut self) -> Result<IngestionExit, IngestionError> {
        info!(
            next_height = self.sequencer.next_height(),
            "IngestionRunner started"
        );
        let result = self.run_loop().await;
        match &result {
            Ok(exit) => {
                info!(exit = ?exit, "IngestionRunner stopped");
                self.set_state(IngestionState::Stopped);
            }
            Err(e) => {
                error!(error = %e, "Ingestion halted, operator intervention required");
                self.set_state(IngestionState::Halted {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_loop(&mut self) -> Result<IngestionExit, IngestionError> {
        let mut source_failures = 0u32;
        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(IngestionExit::Shutdown);
            }

            let next = tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("IngestionRunner received shutdown signal");
                        return Ok(IngestionExit::Shutdown);
                    }
                    continue;
                }

                next = self.sequencer.next() => next,
            };

            let block = match next {
                Ok(Some(block)) => {
                    source_failures = 0;
                    block
                }
                Ok(None) => return Ok(IngestionExit::EndOfStream),
                Err(e) if e.is_transient() && source_failures < self.policy.max_retries => {
                    let delay = self.policy.delay(source_failures);
                    source_failures += 1;
                    warn!(error = %e, attempt = source_failures, "Block source failed, retrying");
                    if self.wait_or_shutdown(delay).await {
                        return Ok(IngestionExit::Shutdown);
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.apply_with_retry(&block).await? {
                Some(applied) => self.record(applied),
                None => return Ok(IngestionExit::Shutdown),
            }
        }
    }

    /// Apply one block, retrying transient failures. `None` if shutdown was
    /// requested while waiting to retry; the block stays uncommitted.
    async fn apply_with_retry(
        &mut self,
        block: &RawBlock,
    ) -> Result<Option<Applied>, IngestionError> {
        let height = block.height;
        let mut retries = 0u32;
        loop {
            let error = match self.processor.apply(block).await {
                Ok(applied) => return Ok(Some(applied)),
                Err(e) => e,
            };

            if !error.is_transient() {
                return Err(IngestionError::Fatal {
                    height,
                    source: error,
                });
            }
            if retries >= self.policy.max_retries {
                return Err(IngestionError::RetriesExhausted {
                    height,
                    attempts: retries + 1,
                    source: error,
                });
            }

            let delay = self.policy.delay(retries);
            retries += 1;
            warn!(
                height,
                error = %error,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying block"
            );
            self.set_state(IngestionState::Retrying {
                height,
                attempt: retries,
            });
            if self.wait_or_shutdown(delay).await {
                return Ok(None);
            }
            if let Err(e) = self.processor.refresh_caches().await {
                warn!(height, error = %e, "Cache refresh before retry failed");
            }
        }
    }

    /// Sleep for `delay`; `true` if shutdown was requested meanwhile.
    async fn wait_or_shutdown(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            biased;

            changed = self.shutdown_rx.changed() => {
                changed.is_err() || *self.shutdown_rx.borrow()
            }

            _ = tokio::time::sleep(delay) => false,
        }
    }

    fn record(&mut self, applied: Applied) {
        let height = applied.height();
        match applied {
            Applied::Committed {
                events, mutations, ..
            } => {
                info!(height, events, mutations, "Block committed");
            }
            Applied::Duplicate { .. } => {
                info!(height, "Block already committed");
            }
        }
        self.sequencer.mark_committed(height);
        self.status_tx.send_replace(IngestionStatus {
            last_committed_height: self.sequencer.last_committed(),
            state: IngestionState::Running,
        });
    }

    fn set_state(&self, state: IngestionState) {
        self.status_tx.send_modify(|status| status.state = state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caches::DerivedStateCaches;
    use crate::processors::block_processor::testing::{block, genesis, raw_event};
    use crate::processors::sequencer::ChannelBlockSource;
    use crate::store::{BlockStore, MemoryStore};
    use pxidx_sdk::objects::EventOrdering;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        store: MemoryStore,
        blocks: mpsc::Sender<RawBlock>,
        shutdown: watch::Sender<bool>,
        runner: IngestionRunner,
    }

    async fn fixture(policy: RetryPolicy) -> Fixture {
        let store = MemoryStore::new();
        let (blocks, rx) = mpsc::channel(16);
        let sequencer = Sequencer::resume(
            Box::new(ChannelBlockSource::new(rx)),
            &store,
            1,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let processor = BlockProcessor::new(Arc::new(store.clone()), DerivedStateCaches::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = IngestionRunner::new(sequencer, processor, policy, shutdown_rx);
        Fixture {
            store,
            blocks,
            shutdown,
            runner,
        }
    }

    #[tokio::test]
    async fn test_runs_blocks_until_end_of_stream() {
        let fixture = fixture(RetryPolicy::immediate(0)).await;
        let status = fixture.runner.status();
        for raw in [genesis(), genesis(), block(2, 0, vec![])] {
            fixture.blocks.send(raw).await.unwrap();
        }
        drop(fixture.blocks);

        let exit = fixture.runner.run().await.unwrap();
        assert_eq!(exit, IngestionExit::EndOfStream);
        assert_eq!(fixture.store.last_committed_height().await.unwrap(), Some(2));
        assert_eq!(
            *status.borrow(),
            IngestionStatus {
                last_committed_height: Some(2),
                state: IngestionState::Stopped,
            }
        );
        drop(fixture.shutdown);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_is_retried() {
        let fixture = fixture(RetryPolicy::immediate(3)).await;
        fixture.blocks.send(genesis()).await.unwrap();
        fixture.store.fail_next_commits(2).await;
        drop(fixture.blocks);

        let exit = fixture.runner.run().await.unwrap();
        assert_eq!(exit, IngestionExit::EndOfStream);
        assert_eq!(fixture.store.last_committed_height().await.unwrap(), Some(1));
        drop(fixture.shutdown);
    }

    #[tokio::test]
    async fn test_exhausted_retries_halt() {
        let fixture = fixture(RetryPolicy::immediate(1)).await;
        let status = fixture.runner.status();
        fixture.blocks.send(genesis()).await.unwrap();
        fixture.store.fail_next_commits(5).await;

        let error = fixture.runner.run().await.unwrap_err();
        assert!(matches!(
            error,
            IngestionError::RetriesExhausted {
                height: 1,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(fixture.store.last_committed_height().await.unwrap(), None);
        assert!(matches!(status.borrow().state, IngestionState::Halted { .. }));
        drop(fixture.shutdown);
    }

    #[tokio::test]
    async fn test_unknown_event_halts_without_retry() {
        let fixture = fixture(RetryPolicy::immediate(5)).await;
        fixture.blocks.send(genesis()).await.unwrap();
        fixture
            .blocks
            .send(block(
                2,
                0,
                vec![raw_event(
                    EventOrdering::EndBlock,
                    0,
                    "mystery",
                    json!({}),
                )],
            ))
            .await
            .unwrap();

        let error = fixture.runner.run().await.unwrap_err();
        assert!(matches!(
            error,
            IngestionError::Fatal {
                height: 2,
                source: ApplyError::UnknownEvent { .. }
            }
        ));
        assert_eq!(fixture.store.last_committed_height().await.unwrap(), Some(1));
        drop(fixture.shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_between_blocks() {
        let fixture = fixture(RetryPolicy::immediate(0)).await;
        let status = fixture.runner.status();
        let handle = tokio::spawn(fixture.runner.run());

        fixture.blocks.send(genesis()).await.unwrap();
        fixture.blocks.send(block(2, 0, vec![])).await.unwrap();
        let mut watcher = status.clone();
        watcher
            .wait_for(|status| status.last_committed_height == Some(2))
            .await
            .unwrap();

        fixture.shutdown.send(true).unwrap();
        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit, IngestionExit::Shutdown);
        assert_eq!(status.borrow().state, IngestionState::Stopped);
        assert_eq!(fixture.store.last_committed_height().await.unwrap(), Some(2));
    }
}
