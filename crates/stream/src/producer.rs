//! Deduplicating producer.
//!
//! `send` never blocks: submissions go onto an unbounded queue drained by a
//! background task, and every submission gets exactly one confirmation
//! callback, whether it was stored, deduplicated, rejected or abandoned on
//! close.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::broker::{AppendOutcome, StreamBroker};
use crate::confirm::{ConfirmationCode, ConfirmationStatus};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::types::{PublishingId, duration_millis};

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_confirm_timeout() -> Duration {
    DEFAULT_CONFIRM_TIMEOUT
}

/// Configuration for a [`Producer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Stream to publish to.
    pub stream: String,

    /// Producer name. Enables deduplication and resume.
    #[serde(default)]
    pub name: Option<String>,

    /// Maximum submissions appended per drain of the queue.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long one append may take before it is confirmed as `Timeout`.
    /// Zero waits indefinitely.
    #[serde(with = "duration_millis", default = "default_confirm_timeout")]
    pub confirm_timeout: Duration,
}

impl ProducerConfig {
    /// Create a config for an unnamed producer on `stream`.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            name: None,
            batch_size: DEFAULT_BATCH_SIZE,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for an empty stream or name, or a zero batch size.
    pub fn validate(&self) -> Result<()> {
        if self.stream.trim().is_empty() {
            return Err(Error::invalid_config("producer stream must not be empty"));
        }
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::invalid_config("producer name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_config("producer batch_size must be positive"));
        }
        Ok(())
    }
}

type ConfirmCallback = Box<dyn FnOnce(ConfirmationStatus) + Send + 'static>;

struct Submission {
    record: Record,
    on_confirm: ConfirmCallback,
}

impl Submission {
    fn fail(self, code: ConfirmationCode) {
        let status = ConfirmationStatus::failed(self.record.publishing_id(), code);
        (self.on_confirm)(status);
    }
}

/// A publishing session on one stream.
pub struct Producer {
    stream: String,
    name: Option<String>,
    broker: Arc<dyn StreamBroker>,
    submissions: mpsc::UnboundedSender<Submission>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    /// Highest publishing id submitted this session, plus one. Zero means none.
    highest_submitted: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    /// Open a publishing session.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for a bad config and
    /// `Error::StreamNotFound` when the stream does not exist.
    pub async fn open(broker: Arc<dyn StreamBroker>, config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        broker.stream_bounds(&config.stream).await?;

        let (submissions, queue) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = PublishWorker {
            broker: Arc::clone(&broker),
            stream: config.stream.clone(),
            name: config.name.clone(),
            batch_size: config.batch_size,
            confirm_timeout: config.confirm_timeout,
        };
        let handle = tokio::spawn(worker.run(queue, shutdown_rx));

        tracing::info!(
            stream = %config.stream,
            producer = ?config.name,
            "Producer opened"
        );

        Ok(Self {
            stream: config.stream,
            name: config.name,
            broker,
            submissions,
            shutdown,
            closed: AtomicBool::new(false),
            highest_submitted: AtomicU64::new(0),
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submit a record for asynchronous append.
    ///
    /// Returns immediately. `on_confirm` runs exactly once on the producer's
    /// background task. Broker failures are reported through it, never here.
    ///
    /// # Errors
    /// Returns `Error::ProducerClosed` after `close`, and
    /// `Error::PublishingIdRegression` when a named producer reuses an id lower
    /// than one already submitted in this session. In both cases `on_confirm`
    /// is not called.
    pub fn send<F>(&self, record: Record, on_confirm: F) -> Result<()>
    where
        F: FnOnce(ConfirmationStatus) + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::producer_closed(&self.stream));
        }
        if let (Some(name), Some(id)) = (self.name.as_deref(), record.publishing_id()) {
            self.guard_publishing_id(name, id)?;
        }

        let submission = Submission {
            record,
            on_confirm: Box::new(on_confirm),
        };
        self.submissions
            .send(submission)
            .map_err(|_| Error::producer_closed(&self.stream))
    }

    /// Submit a record and wait for its confirmation.
    ///
    /// # Errors
    /// Same as [`send`](Self::send). A failed append is a status, not an error.
    pub async fn send_with_confirm(&self, record: Record) -> Result<ConfirmationStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(record, move |status| {
            let _ = tx.send(status);
        })?;
        rx.await.map_err(|_| Error::producer_closed(&self.stream))
    }

    /// Highest publishing id the broker holds for this producer, or 0 if none.
    ///
    /// # Errors
    /// Returns `Error::UnnamedProducer` for an unnamed producer.
    pub async fn last_publishing_id(&self) -> Result<PublishingId> {
        Ok(self.last_confirmed_publishing_id().await?.unwrap_or(0))
    }

    /// Highest publishing id the broker holds for this producer, if any.
    ///
    /// # Errors
    /// Returns `Error::UnnamedProducer` for an unnamed producer.
    pub async fn last_confirmed_publishing_id(&self) -> Result<Option<PublishingId>> {
        let name = self
            .name
            .as_deref()
            .ok_or_else(|| Error::unnamed_producer(&self.stream))?;
        self.broker.fetch_last_publishing_id(name, &self.stream).await
    }

    /// First publishing id that still needs sending after a restart.
    ///
    /// # Errors
    /// Returns `Error::UnnamedProducer` for an unnamed producer.
    pub async fn resume_point(&self) -> Result<PublishingId> {
        let last = self.last_confirmed_publishing_id().await?;
        Ok(last.map_or(0, |id| id.saturating_add(1)))
    }

    /// Close the session.
    ///
    /// Submissions not yet appended are confirmed as `ProducerClosed` before
    /// this returns. Safe to call more than once.
    ///
    /// # Errors
    /// Returns `Error::Internal` if the background task panicked.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Internal(format!("producer task failed: {e}")))?;
            tracing::info!(stream = %self.stream, producer = ?self.name, "Producer closed");
        }
        Ok(())
    }

    fn guard_publishing_id(&self, name: &str, id: PublishingId) -> Result<()> {
        self.highest_submitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let regressed = current > 0 && id < current.saturating_sub(1);
                (!regressed).then(|| current.max(id.saturating_add(1)))
            })
            .map(|_| ())
            .map_err(|current| {
                Error::publishing_id_regression(name, &self.stream, current.saturating_sub(1), id)
            })
    }
}

struct PublishWorker {
    broker: Arc<dyn StreamBroker>,
    stream: String,
    name: Option<String>,
    batch_size: usize,
    confirm_timeout: Duration,
}

impl PublishWorker {
    async fn run(
        self,
        mut queue: mpsc::UnboundedReceiver<Submission>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut batch = Vec::with_capacity(self.batch_size);
        loop {
            if shutdown_requested(&shutdown) {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = queue.recv_many(&mut batch, self.batch_size) => {
                    if received == 0 {
                        break;
                    }
                    tracing::trace!(stream = %self.stream, received, "Publishing batch");
                    for submission in batch.drain(..) {
                        if shutdown_requested(&shutdown) {
                            submission.fail(ConfirmationCode::ProducerClosed);
                        } else {
                            self.publish(submission, &mut shutdown).await;
                        }
                    }
                }
            }
        }

        queue.close();
        let mut abandoned = 0_usize;
        while let Some(submission) = queue.recv().await {
            submission.fail(ConfirmationCode::ProducerClosed);
            abandoned = abandoned.saturating_add(1);
        }
        if abandoned > 0 {
            tracing::warn!(
                stream = %self.stream,
                abandoned,
                "Producer closed with unconfirmed submissions"
            );
        }
    }

    async fn publish(&self, submission: Submission, shutdown: &mut watch::Receiver<bool>) {
        let Submission { record, on_confirm } = submission;
        let requested_id = record.publishing_id();
        let dedup_id = self.name.as_ref().and(requested_id);

        let append = self
            .broker
            .append(&self.stream, self.name.as_deref(), dedup_id, record);
        let bounded = async {
            if self.confirm_timeout.is_zero() {
                Some(append.await)
            } else {
                tokio::time::timeout(self.confirm_timeout, append).await.ok()
            }
        };
        let result = tokio::select! {
            biased;
            result = bounded => result,
            () = wait_for_shutdown(shutdown) => {
                on_confirm(ConfirmationStatus::failed(requested_id, ConfirmationCode::ProducerClosed));
                return;
            }
        };

        let status = match result {
            Some(Ok(AppendOutcome::Stored(offset))) => {
                ConfirmationStatus::stored(requested_id, offset)
            }
            Some(Ok(AppendOutcome::Duplicate)) => ConfirmationStatus::deduplicated(requested_id),
            Some(Err(e)) => {
                tracing::warn!(
                    stream = %self.stream,
                    publishing_id = ?requested_id,
                    error = %e,
                    "Append failed"
                );
                ConfirmationStatus::failed(requested_id, ConfirmationCode::from(&e))
            }
            None => {
                tracing::warn!(
                    stream = %self.stream,
                    publishing_id = ?requested_id,
                    timeout = ?self.confirm_timeout,
                    "Append timed out"
                );
                ConfirmationStatus::failed(requested_id, ConfirmationCode::Timeout)
            }
        };
        on_confirm(status);
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolves once close is requested or the producer is dropped.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::confirm::ConfirmationTracker;
    use crate::types::StreamOptions;

    async fn broker_with_stream(stream: &str) -> Arc<InMemoryBroker> {
        let broker = InMemoryBroker::new_arc();
        broker
            .create_stream(stream, StreamOptions::default())
            .await
            .unwrap();
        broker
    }

    // ==========================================================================
    // ProducerConfig BEHAVIORAL TESTS
    // ==========================================================================

    #[test]
    fn should_apply_defaults_when_deserializing() {
        let config: ProducerConfig = serde_json::from_str(r#"{"stream":"s"}"#).unwrap();

        assert_eq!(config, ProducerConfig::new("s"));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.confirm_timeout, Duration::from_secs(30));
    }

    #[test]
    fn should_reject_invalid_config() {
        assert!(ProducerConfig::new("").validate().is_err());
        assert!(ProducerConfig::new("s").with_name(" ").validate().is_err());
        assert!(ProducerConfig::new("s").with_batch_size(0).validate().is_err());
        assert!(ProducerConfig::new("s").with_name("app-1").validate().is_ok());
    }

    // ==========================================================================
    // Producer BEHAVIORAL TESTS
    // ==========================================================================

    #[tokio::test]
    async fn should_fail_to_open_on_missing_stream() {
        let broker = InMemoryBroker::new_arc();

        let result = Producer::open(broker, ProducerConfig::new("missing")).await;

        assert!(matches!(result, Err(Error::StreamNotFound { .. })));
    }

    #[tokio::test]
    async fn should_confirm_stored_and_deduplicated_records() {
        let broker = broker_with_stream("s").await;
        let producer = Producer::open(broker, ProducerConfig::new("s").with_name("app-1"))
            .await
            .unwrap();

        let first = producer
            .send_with_confirm(Record::new("message 0").with_publishing_id(0))
            .await
            .unwrap();
        let again = producer
            .send_with_confirm(Record::new("message 0").with_publishing_id(0))
            .await
            .unwrap();

        assert_eq!(first.code(), ConfirmationCode::Ok);
        assert_eq!(first.offset(), Some(0));
        assert_eq!(again.code(), ConfirmationCode::Deduplicated);
        assert_eq!(producer.last_publishing_id().await.unwrap(), 0);
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_ignore_publishing_ids_when_unnamed() {
        let broker = broker_with_stream("s").await;
        let producer = Producer::open(broker.clone(), ProducerConfig::new("s"))
            .await
            .unwrap();

        for _ in 0..2 {
            let status = producer
                .send_with_confirm(Record::new("same").with_publishing_id(1))
                .await
                .unwrap();
            assert_eq!(status.code(), ConfirmationCode::Ok);
        }

        assert_eq!(broker.stream_bounds("s").await.unwrap().len(), 2);
        assert!(matches!(
            producer.last_publishing_id().await,
            Err(Error::UnnamedProducer { .. })
        ));
    }

    #[tokio::test]
    async fn should_resume_at_zero_without_history() {
        let broker = broker_with_stream("s").await;
        let producer = Producer::open(broker, ProducerConfig::new("s").with_name("fresh"))
            .await
            .unwrap();

        assert_eq!(producer.last_confirmed_publishing_id().await.unwrap(), None);
        assert_eq!(producer.last_publishing_id().await.unwrap(), 0);
        assert_eq!(producer.resume_point().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn should_reject_lower_publishing_id_in_same_session() {
        let broker = broker_with_stream("s").await;
        let producer = Producer::open(broker, ProducerConfig::new("s").with_name("app-1"))
            .await
            .unwrap();

        producer
            .send(Record::new("a").with_publishing_id(5), |_| {})
            .unwrap();
        producer
            .send(Record::new("a").with_publishing_id(5), |_| {})
            .unwrap();
        let regression = producer.send(Record::new("b").with_publishing_id(4), |_| {});

        assert!(matches!(
            regression,
            Err(Error::PublishingIdRegression {
                highest: 5,
                attempted: 4,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn should_fail_fast_after_close() {
        let broker = broker_with_stream("s").await;
        let producer = Producer::open(broker, ProducerConfig::new("s")).await.unwrap();

        producer.close().await.unwrap();
        producer.close().await.unwrap();

        let result = producer.send(Record::new("late"), |_| {});
        assert!(matches!(result, Err(Error::ProducerClosed { .. })));
    }

    #[tokio::test]
    async fn should_confirm_failures_when_broker_unavailable() {
        let broker = broker_with_stream("s").await;
        let producer = Producer::open(broker.clone(), ProducerConfig::new("s"))
            .await
            .unwrap();
        broker.set_unavailable(true);

        let status = producer.send_with_confirm(Record::new("a")).await.unwrap();

        assert!(!status.is_confirmed());
        assert_eq!(status.code(), ConfirmationCode::Unavailable);
    }

    #[tokio::test]
    async fn should_fire_every_callback_once() {
        let broker = broker_with_stream("s").await;
        let producer = Producer::open(
            broker,
            ProducerConfig::new("s").with_name("app-1").with_batch_size(7),
        )
        .await
        .unwrap();
        let tracker = Arc::new(ConfirmationTracker::expecting(50));

        for i in 0..50 {
            producer
                .send(Record::new(format!("message {i}")).with_publishing_id(i), tracker.callback())
                .unwrap();
        }

        assert!(tracker.await_all(Duration::from_secs(5)).await);
        assert_eq!(tracker.confirmed_count(), 50);
        assert_eq!(producer.last_publishing_id().await.unwrap(), 49);
    }
}
