//! Downstream Notifier.
//!
//! The NotificationPublisher is responsible for:
//! - Receiving `CommittedBlock` events from the orchestrator
//! - Turning them into one `ChangeNotification` per (event, aggregate)
//! - Delivering the resulting batch to a sink
//! - Retrying failed batches in the background with exponential backoff
//!   (2^0 to 2^11 seconds), without holding up later batches
//!
//! Delivery runs outside the ingestion path. A failed delivery is logged and
//! never reopens the committed block.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use itertools::Itertools;
use pxidx_sdk::objects::{ChangeNotification, NotificationBatch};
use pxidx_sdk::signature::{SIGNATURE_HEADER, SignedObject};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::events::{
    CommittedBlock, CommittedBlockReceiver, CommittedBlockSender, DEFAULT_CHANNEL_BUFFER,
};
use crate::mutation::AggregateKey;
use crate::utils::backoff::calculate_retry_delay;

/// Errors that can occur during notification delivery.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// Payload serialization error
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Webhook delivery failed (non-2xx status)
    #[error("webhook delivery failed with status {status}: {body}")]
    DeliveryFailed { status: u16, body: String },
}

/// Build the notification batch of a committed block.
///
/// Mutations of one event that touch the same aggregate are merged into a
/// single notification whose payload groups the written rows by kind.
pub fn build_batch(block: &CommittedBlock) -> Result<NotificationBatch, NotifierError> {
    let mut notifications = Vec::new();
    let events = block.mutations.iter().chunk_by(|applied| applied.event_id);
    for (_, group) in &events {
        let mut position = None;
        let mut by_aggregate: BTreeMap<AggregateKey, BTreeMap<&'static str, Vec<serde_json::Value>>> =
            BTreeMap::new();
        for applied in group {
            position = Some((applied.ordering, applied.event_index));
            let aggregates = applied.mutation.aggregates();
            if aggregates.is_empty() {
                continue;
            }
            let payload = applied.mutation.payload()?;
            for key in aggregates {
                by_aggregate
                    .entry(key)
                    .or_default()
                    .entry(applied.mutation.payload_key())
                    .or_default()
                    .push(payload.clone());
            }
        }
        let Some((ordering, event_index)) = position else {
            continue;
        };
        for (key, rows) in by_aggregate {
            notifications.push(ChangeNotification {
                aggregate_type: key.aggregate_type,
                aggregate_id: key.aggregate_id,
                block_height: block.height,
                tx_index: ordering.tx_index(),
                ordering,
                event_index,
                payload: serde_json::to_value(rows)?,
            });
        }
    }
    Ok(NotificationBatch {
        block_height: block.height,
        notifications,
    })
}

/// Where notification batches end up.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, batch: &NotificationBatch) -> Result<(), NotifierError>;
}

/// Posts each batch as JSON to a webhook, signed when a secret is configured.
pub struct WebhookSink {
    url: Url,
    secret: Option<Vec<u8>>,
    http_client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: Url, secret: Option<Vec<u8>>) -> Self {
        Self {
            url,
            secret,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// JSON body and, with a secret, the signature header value.
    fn encode(&self, batch: &NotificationBatch) -> Result<(String, Option<String>), NotifierError> {
        match &self.secret {
            Some(secret) => {
                let signed = SignedObject::new(batch.clone(), secret)?;
                let header = signed.to_header();
                Ok((signed.json, Some(header)))
            }
            None => Ok((serde_json::to_string(batch)?, None)),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, batch: &NotificationBatch) -> Result<(), NotifierError> {
        let (body, signature) = self.encode(batch)?;
        let mut request = self
            .http_client
            .post(self.url.clone())
            .header("Content-Type", "application/json");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(NotifierError::DeliveryFailed {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Sink used when no webhook is configured: batches are only logged.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, batch: &NotificationBatch) -> Result<(), NotifierError> {
        info!(
            height = batch.block_height,
            notifications = batch.notifications.len(),
            "Notification batch"
        );
        Ok(())
    }
}

/// Orchestrator side of the notifier. Publishing never waits.
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    tx: CommittedBlockSender,
    dropped: Arc<AtomicU64>,
}

impl NotifierHandle {
    pub fn new(tx: CommittedBlockSender) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Batches dropped so far because the publisher queue was full or gone.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }

    pub fn publish(&self, block: CommittedBlock) {
        if block.is_empty() {
            return;
        }
        let height = block.height;
        match self.tx.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped_total = self.record_drop();
                error!(height, dropped_total, "Notification queue full, batch dropped");
            }
            Err(TrySendError::Closed(_)) => {
                let dropped_total = self.record_drop();
                warn!(height, dropped_total, "Notification publisher stopped, batch dropped");
            }
        }
    }

    fn record_drop(&self) -> u64 {
        self.dropped
            .fetch_add(1, AtomicOrdering::Relaxed)
            .saturating_add(1)
    }
}

/// Batches waiting for a retry at most. Past it the oldest one is given up.
pub const MAX_PENDING_RETRIES: usize = 1024;

/// A batch whose last delivery attempt failed.
#[derive(Debug)]
struct PendingRetry {
    batch: NotificationBatch,
    attempts: u32,
    due: Instant,
}

impl PendingRetry {
    /// Schedule the next attempt after `attempts` failed ones.
    fn after_failure(batch: NotificationBatch, attempts: u32) -> Self {
        Self {
            batch,
            attempts,
            due: Instant::now() + calculate_retry_delay(attempts.saturating_sub(1)),
        }
    }
}

fn batch_of(block: &CommittedBlock) -> Option<NotificationBatch> {
    match build_batch(block) {
        Ok(batch) if batch.notifications.is_empty() => None,
        Ok(batch) => Some(batch),
        Err(e) => {
            error!(height = block.height, error = %e, "Failed to build notification batch");
            None
        }
    }
}

/// One delivery attempt, logged.
async fn attempt(sink: &dyn NotificationSink, batch: &NotificationBatch, attempt: u32) -> bool {
    match sink.deliver(batch).await {
        Ok(()) => {
            debug!(
                height = batch.block_height,
                notifications = batch.notifications.len(),
                attempt,
                "Notification batch delivered"
            );
            true
        }
        Err(e) => {
            warn!(
                height = batch.block_height,
                error = %e,
                attempt,
                "Notification delivery failed"
            );
            false
        }
    }
}

/// NotificationPublisher delivers committed blocks to a sink.
///
/// Each batch gets one attempt as it arrives. Failed batches move to a
/// background retry loop, so a sink outage never stalls the intake queue.
pub struct NotificationPublisher {
    sink: Arc<dyn NotificationSink>,
    block_rx: CommittedBlockReceiver,
    shutdown_rx: watch::Receiver<bool>,
    max_attempts: u32,
}

impl NotificationPublisher {
    /// Create a new NotificationPublisher.
    ///
    /// # Arguments
    ///
    /// * `sink` - Destination of every batch
    /// * `block_rx` - Receiver for CommittedBlock events
    /// * `shutdown_rx` - Receiver for shutdown signal
    /// * `max_attempts` - Deliveries tried per batch before it is given up
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        block_rx: CommittedBlockReceiver,
        shutdown_rx: watch::Receiver<bool>,
        max_attempts: u32,
    ) -> Self {
        Self {
            sink,
            block_rx,
            shutdown_rx,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run the NotificationPublisher.
    ///
    /// Returns on shutdown, or once the intake channel is closed and every
    /// pending retry has been delivered or given up.
    pub async fn run(mut self) {
        info!("NotificationPublisher started");

        let (retry_tx, retry_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER);
        let retry_loop = RetryLoop {
            sink: self.sink.clone(),
            retry_rx,
            shutdown_rx: self.shutdown_rx.clone(),
            max_attempts: self.max_attempts,
            pending: VecDeque::new(),
            given_up: 0,
        };
        let retry_handle = tokio::spawn(retry_loop.run());

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("NotificationPublisher received shutdown signal");
                        self.drain().await;
                        break;
                    }
                }

                block = self.block_rx.recv() => match block {
                    Some(block) => self.deliver(block, &retry_tx).await,
                    None => {
                        info!("CommittedBlock channel closed");
                        break;
                    }
                },
            }
        }

        drop(retry_tx);
        if let Err(e) = retry_handle.await {
            error!(error = %e, "Notification retry task failed");
        }
        info!("NotificationPublisher shutdown complete");
    }

    /// Deliver what is already queued, one attempt each.
    async fn drain(&mut self) {
        let mut drained = 0usize;
        while let Ok(block) = self.block_rx.try_recv() {
            if let Some(batch) = batch_of(&block) {
                attempt(self.sink.as_ref(), &batch, 1).await;
            }
            drained += 1;
        }
        if drained > 0 {
            info!(blocks = drained, "Drained notification queue");
        }
    }

    /// First attempt; a failure is handed to the retry loop.
    async fn deliver(&self, block: CommittedBlock, retry_tx: &mpsc::Sender<PendingRetry>) {
        let Some(batch) = batch_of(&block) else {
            return;
        };
        if attempt(self.sink.as_ref(), &batch, 1).await {
            return;
        }
        if self.max_attempts <= 1 {
            error!(height = batch.block_height, attempts = 1, "Giving up on notification batch");
            return;
        }
        if let Err(e) = retry_tx.send(PendingRetry::after_failure(batch, 1)).await {
            error!(
                height = e.0.batch.block_height,
                "Notification retry loop stopped, batch dropped"
            );
        }
    }
}

/// Background redelivery of failed batches with exponential backoff.
struct RetryLoop {
    sink: Arc<dyn NotificationSink>,
    retry_rx: mpsc::Receiver<PendingRetry>,
    shutdown_rx: watch::Receiver<bool>,
    max_attempts: u32,
    pending: VecDeque<PendingRetry>,
    given_up: u64,
}

impl RetryLoop {
    async fn run(mut self) {
        let mut intake_open = true;
        loop {
            if *self.shutdown_rx.borrow() {
                self.abandon();
                break;
            }
            if !intake_open && self.pending.is_empty() {
                break;
            }
            let next_due = self.pending.iter().map(|retry| retry.due).min();

            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        self.abandon();
                        break;
                    }
                }

                retry = self.retry_rx.recv(), if intake_open => match retry {
                    Some(retry) => self.enqueue(retry),
                    None => intake_open = false,
                },

                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.retry_due().await;
                }
            }
        }
    }

    fn enqueue(&mut self, retry: PendingRetry) {
        if self.pending.len() >= MAX_PENDING_RETRIES {
            if let Some(oldest) = self.pending.pop_front() {
                self.give_up(&oldest, "retry queue full");
            }
        }
        self.pending.push_back(retry);
    }

    async fn retry_due(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|retry| retry.due <= now);
        self.pending = waiting.into();

        for retry in due {
            let attempts = retry.attempts.saturating_add(1);
            if attempt(self.sink.as_ref(), &retry.batch, attempts).await {
                continue;
            }
            let next = PendingRetry::after_failure(retry.batch, attempts);
            if attempts >= self.max_attempts {
                self.give_up(&next, "attempts exhausted");
            } else {
                self.pending.push_back(next);
            }
        }
    }

    fn give_up(&mut self, retry: &PendingRetry, reason: &'static str) {
        self.given_up = self.given_up.saturating_add(1);
        error!(
            height = retry.batch.block_height,
            attempts = retry.attempts,
            reason,
            given_up_total = self.given_up,
            "Giving up on notification batch"
        );
    }

    fn abandon(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        warn!(
            batches = self.pending.len(),
            "Shutting down with undelivered notification batches"
        );
        for retry in std::mem::take(&mut self.pending) {
            self.give_up(&retry, "shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EventId;
    use crate::entities::market::AssetRow;
    use crate::entities::subaccount::AssetPositionRow;
    use crate::events::{AppliedMutation, committed_block_channel};
    use crate::mutation::{Mutation, SubaccountTouch};
    use pxidx_sdk::objects::{AggregateType, EventOrdering};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use time::OffsetDateTime;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn applied(ordering: EventOrdering, event_index: u32, mutation: Mutation) -> AppliedMutation {
        AppliedMutation {
            event_id: EventId::new(7, ordering, event_index),
            ordering,
            event_index,
            mutation,
        }
    }

    fn touch(id: Uuid) -> Mutation {
        Mutation::TouchSubaccount(SubaccountTouch {
            id,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            updated_at_height: 7,
        })
    }

    fn sample_block() -> CommittedBlock {
        let alice = Uuid::from_u128(1);
        let tx = EventOrdering::Transaction(3);
        CommittedBlock {
            height: 7,
            mutations: vec![
                applied(
                    EventOrdering::BeginBlock,
                    0,
                    Mutation::CreateAsset(AssetRow {
                        id: 0,
                        symbol: "USDC".to_string(),
                        atomic_resolution: -6,
                    }),
                ),
                applied(
                    tx,
                    1,
                    Mutation::UpsertAssetPosition(AssetPositionRow {
                        id: Uuid::from_u128(2),
                        subaccount_id: alice,
                        asset_id: 0,
                        size: Decimal::from(10),
                    }),
                ),
                applied(tx, 1, touch(alice)),
                applied(tx, 2, touch(alice)),
            ],
        }
    }

    #[test]
    fn test_one_notification_per_event_and_aggregate() {
        let batch = build_batch(&sample_block()).unwrap();
        assert_eq!(batch.block_height, 7);
        assert_eq!(batch.notifications.len(), 2);

        let first = &batch.notifications[0];
        assert_eq!(first.aggregate_type, AggregateType::Subaccount);
        assert_eq!(first.aggregate_id, Uuid::from_u128(1).to_string());
        assert_eq!(first.tx_index, Some(3));
        assert_eq!(first.event_index, 1);
        assert_eq!(first.payload["assetPositions"].as_array().map(Vec::len), Some(1));
        assert_eq!(first.payload["subaccounts"].as_array().map(Vec::len), Some(1));

        assert_eq!(batch.notifications[1].event_index, 2);
    }

    #[test]
    fn test_signed_webhook_body_verifies() {
        let secret = b"notifier-secret".to_vec();
        let sink = WebhookSink::new(
            Url::parse("http://localhost:9000/hook").unwrap(),
            Some(secret.clone()),
        );
        let batch = build_batch(&sample_block()).unwrap();
        let (body, header) = sink.encode(&batch).unwrap();
        let signed =
            SignedObject::<NotificationBatch>::from_header_and_body(&header.unwrap(), body)
                .unwrap();
        assert_eq!(signed.verify(&secret).unwrap(), batch);
    }

    struct FlakySink {
        failures_left: AtomicU32,
        delivered: Mutex<Vec<NotificationBatch>>,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn deliver(&self, batch: &NotificationBatch) -> Result<(), NotifierError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(NotifierError::DeliveryFailed {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.delivered.lock().await.push(batch.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_retried() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(2),
            delivered: Mutex::new(Vec::new()),
        });
        let (block_tx, block_rx) = committed_block_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let publisher = NotificationPublisher::new(sink.clone(), block_rx, shutdown_rx, 5);

        NotifierHandle::new(block_tx.clone()).publish(sample_block());
        drop(block_tx);
        publisher.run().await;

        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].block_height, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_drop_the_batch() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(10),
            delivered: Mutex::new(Vec::new()),
        });
        let (block_tx, block_rx) = committed_block_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let publisher = NotificationPublisher::new(sink.clone(), block_rx, shutdown_rx, 3);

        NotifierHandle::new(block_tx.clone()).publish(sample_block());
        drop(block_tx);
        publisher.run().await;

        assert!(sink.delivered.lock().await.is_empty());
        assert_eq!(sink.failures_left.load(Ordering::SeqCst), 7);
    }

    fn block_at(height: u32) -> CommittedBlock {
        CommittedBlock {
            height,
            ..sample_block()
        }
    }

    /// Rejects every batch of one height and records the rest.
    struct StuckHeightSink {
        failing_height: u32,
        started: Instant,
        attempts: Mutex<BTreeMap<u32, u32>>,
        delivered: Mutex<Vec<(u32, std::time::Duration)>>,
    }

    impl StuckHeightSink {
        fn new(failing_height: u32) -> Self {
            Self {
                failing_height,
                started: Instant::now(),
                attempts: Mutex::new(BTreeMap::new()),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NotificationSink for StuckHeightSink {
        async fn deliver(&self, batch: &NotificationBatch) -> Result<(), NotifierError> {
            *self
                .attempts
                .lock()
                .await
                .entry(batch.block_height)
                .or_default() += 1;
            if batch.block_height == self.failing_height {
                return Err(NotifierError::DeliveryFailed {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            self.delivered
                .lock()
                .await
                .push((batch.block_height, self.started.elapsed()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_batch_does_not_hold_up_later_ones() {
        let sink = Arc::new(StuckHeightSink::new(7));
        let (block_tx, block_rx) = committed_block_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let publisher = NotificationPublisher::new(sink.clone(), block_rx, shutdown_rx, 5);

        let handle = NotifierHandle::new(block_tx.clone());
        for height in [7, 8, 9] {
            handle.publish(block_at(height));
        }
        drop(handle);
        drop(block_tx);
        publisher.run().await;

        let delivered = sink.delivered.lock().await;
        let heights: Vec<u32> = delivered.iter().map(|(height, _)| *height).collect();
        assert_eq!(heights, vec![8, 9]);
        // Delivered before the first backoff of block 7 elapsed.
        assert!(delivered
            .iter()
            .all(|(_, at)| *at < std::time::Duration::from_secs(1)));
        assert_eq!(sink.attempts.lock().await.get(&7), Some(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let sink = Arc::new(StuckHeightSink::new(7));
        let (block_tx, block_rx) = committed_block_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let publisher = NotificationPublisher::new(sink.clone(), block_rx, shutdown_rx, 10);

        NotifierHandle::new(block_tx.clone()).publish(block_at(7));
        let task = tokio::spawn(publisher.run());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        shutdown_tx.send_replace(true);

        tokio::time::timeout(std::time::Duration::from_millis(500), task)
            .await
            .expect("publisher should stop without waiting out the backoff")
            .unwrap();
        assert_eq!(sink.attempts.lock().await.get(&7), Some(&1));
        drop(block_tx);
    }

    #[tokio::test]
    async fn test_dropped_batches_are_counted() {
        let (block_tx, mut block_rx) = mpsc::channel(1);
        let handle = NotifierHandle::new(block_tx);

        handle.publish(block_at(7));
        handle.publish(block_at(8));
        assert_eq!(handle.dropped_batches(), 1);

        assert_eq!(block_rx.recv().await.map(|block| block.height), Some(7));
        block_rx.close();
        handle.clone().publish(block_at(9));
        assert_eq!(handle.dropped_batches(), 2);
    }
}
