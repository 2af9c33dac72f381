//! Offset-tracked consumer.
//!
//! One background task per subscription resolves the start position, then
//! repeats read -> handle -> maybe store. The handler runs on that task only,
//! one record at a time and in offset order, so a stored offset K means every
//! record up to and including K was fully handled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::StreamBroker;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::state::ConsumerState;
use crate::tracking::{TrackingPolicy, TrackingState};
use crate::types::{Offset, OffsetSpec, duration_millis};

const DEFAULT_BATCH_SIZE: usize = 256;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

const fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

/// Exponential backoff for transient broker failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(with = "duration_millis", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before retry number `attempt`, counting from zero.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for a zero initial backoff or a maximum below it.
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(Error::invalid_config("initial_backoff must be positive"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::invalid_config(
                "max_backoff must not be lower than initial_backoff",
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`Consumer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Stream to read from.
    pub stream: String,

    /// Start position when no offset is stored under the consumer name.
    #[serde(default)]
    pub offset: OffsetSpec,

    /// Consumer name. Required to store offsets.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub tracking: TrackingPolicy,

    /// Maximum records fetched per read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl ConsumerConfig {
    /// Create a config for an unnamed consumer reading `stream` from the start.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            offset: OffsetSpec::default(),
            name: None,
            tracking: TrackingPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryConfig::default(),
        }
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: OffsetSpec) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub const fn with_tracking(mut self, tracking: TrackingPolicy) -> Self {
        self.tracking = tracking;
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for an empty stream or name, a zero batch
    /// size, an invalid tracking policy or retry config, and automatic
    /// tracking without a consumer name.
    pub fn validate(&self) -> Result<()> {
        if self.stream.trim().is_empty() {
            return Err(Error::invalid_config("consumer stream must not be empty"));
        }
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::invalid_config("consumer name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_config("consumer batch_size must be positive"));
        }
        self.tracking.validate()?;
        self.retry.validate()?;
        if self.tracking.is_automatic() && self.name.is_none() {
            return Err(Error::invalid_config(
                "automatic offset tracking requires a consumer name",
            ));
        }
        Ok(())
    }
}

/// Per-record view handed to a [`MessageHandler`].
#[derive(Debug)]
pub struct MessageContext {
    stream: Arc<str>,
    consumer_name: Option<Arc<str>>,
    offset: Offset,
    store_requested: bool,
    stop_requested: bool,
}

impl MessageContext {
    fn new(stream: Arc<str>, consumer_name: Option<Arc<str>>, offset: Offset) -> Self {
        Self {
            stream,
            consumer_name,
            offset,
            store_requested: false,
            stop_requested: false,
        }
    }

    /// Offset of the record being handled.
    pub const fn offset(&self) -> Offset {
        self.offset
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn consumer_name(&self) -> Option<&str> {
        self.consumer_name.as_deref()
    }

    /// Store this record's offset once the handler returns successfully.
    ///
    /// # Errors
    /// Returns `Error::UnnamedConsumer` when the consumer has no name.
    pub fn store_offset(&mut self) -> Result<()> {
        if self.consumer_name.is_none() {
            return Err(Error::unnamed_consumer(self.stream.as_ref()));
        }
        self.store_requested = true;
        Ok(())
    }

    /// Stop delivery after this record. Any requested store still happens.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }
}

/// Receives records from a subscription.
///
/// Implemented for closures taking `(&mut MessageContext, &Record)`.
/// Returning an error stops the subscription at that record.
pub trait MessageHandler: Send + 'static {
    fn handle(&mut self, context: &mut MessageContext, record: &Record) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&mut MessageContext, &Record) -> anyhow::Result<()> + Send + 'static,
{
    fn handle(&mut self, context: &mut MessageContext, record: &Record) -> anyhow::Result<()> {
        self(context, record)
    }
}

/// Summary of a finished subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    /// Records handled successfully.
    pub delivered: u64,
    pub last_delivered: Option<Offset>,
    /// Last offset known to be stored, including one found at start-up.
    pub last_stored: Option<Offset>,
}

/// Cloneable stop switch for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConsumerHandle {
    /// Ask the subscription to stop. Delivery ends after the current record.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// A running subscription.
pub struct Consumer {
    stream: String,
    name: Option<String>,
    handle: ConsumerHandle,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<Result<DeliveryReport>>,
}

impl Consumer {
    /// Start delivering records to `handler`. Does not wait for the first record.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` when the config does not validate.
    /// Broker failures surface from [`join`](Self::join).
    pub fn subscribe<H: MessageHandler>(
        broker: Arc<dyn StreamBroker>,
        config: ConsumerConfig,
        handler: H,
    ) -> Result<Self> {
        config.validate()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(ConsumerState::Created);

        let delivery = DeliveryLoop {
            broker,
            stream: Arc::from(config.stream.as_str()),
            name: config.name.as_deref().map(Arc::from),
            offset: config.offset,
            tracking: config.tracking,
            batch_size: config.batch_size,
            retry: config.retry,
            handler,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(delivery.run());

        Ok(Self {
            stream: config.stream,
            name: config.name,
            handle: ConsumerHandle {
                shutdown: Arc::new(shutdown),
            },
            state,
            task,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// A handle other tasks can use to stop this subscription.
    pub fn handle(&self) -> ConsumerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Wait for the subscription to end on its own or through a handle.
    ///
    /// # Errors
    /// Returns the error that stopped delivery, such as `Error::HandlerFailed`.
    pub async fn join(self) -> Result<DeliveryReport> {
        let Self { handle, task, .. } = self;
        let result = task
            .await
            .map_err(|e| Error::Internal(format!("consumer task failed: {e}")))?;
        drop(handle);
        result
    }

    /// Stop delivery and wait for the subscription to end.
    ///
    /// No final offset is stored.
    ///
    /// # Errors
    /// Same as [`join`](Self::join).
    pub async fn close(self) -> Result<DeliveryReport> {
        self.handle.close();
        self.join().await
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

struct DeliveryLoop<H> {
    broker: Arc<dyn StreamBroker>,
    stream: Arc<str>,
    name: Option<Arc<str>>,
    offset: OffsetSpec,
    tracking: TrackingPolicy,
    batch_size: usize,
    retry: RetryConfig,
    handler: H,
    state: watch::Sender<ConsumerState>,
    shutdown: watch::Receiver<bool>,
}

impl<H: MessageHandler> DeliveryLoop<H> {
    async fn run(mut self) -> Result<DeliveryReport> {
        let mut report = DeliveryReport::default();
        let result = self.deliver(&mut report).await;

        self.state.send_modify(|state| *state = state.close());
        match &result {
            Ok(()) => tracing::info!(
                stream = %self.stream,
                consumer = ?self.name,
                delivered = report.delivered,
                last_stored = ?report.last_stored,
                "Consumer closed"
            ),
            Err(e) => tracing::error!(
                stream = %self.stream,
                consumer = ?self.name,
                error = %e,
                "Consumer stopped on error"
            ),
        }
        result.map(|()| report)
    }

    fn transition(&self, next: impl FnOnce(ConsumerState) -> Result<ConsumerState>) -> Result<()> {
        let current = *self.state.borrow();
        let next = next(current)?;
        self.state.send_replace(next);
        Ok(())
    }

    async fn deliver(&mut self, report: &mut DeliveryReport) -> Result<()> {
        self.transition(ConsumerState::start_resolving)?;
        let Some((mut position, mut tracking)) = self.resolve_start().await? else {
            return Ok(());
        };
        report.last_stored = tracking.last_stored();

        let broker = Arc::clone(&self.broker);
        let stream = Arc::clone(&self.stream);
        let Some(mut tail) = retrying(&self.retry, &mut self.shutdown, &stream, "watch", || {
            broker.watch_tail(&stream)
        })
        .await?
        else {
            return Ok(());
        };

        self.transition(ConsumerState::start_delivering)?;
        tracing::info!(
            stream = %self.stream,
            consumer = ?self.name,
            position,
            "Consumer delivering"
        );

        loop {
            if stop_requested(&self.shutdown) {
                return Ok(());
            }

            tail.borrow_and_update();
            let batch_size = self.batch_size;
            let Some(batch) = retrying(&self.retry, &mut self.shutdown, &stream, "read", || {
                broker.read(&stream, position, batch_size)
            })
            .await?
            else {
                return Ok(());
            };

            if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.changed() => {}
                    changed = tail.changed() => {
                        if changed.is_err() {
                            return Err(Error::stream_not_found(stream.as_ref()));
                        }
                    }
                }
                continue;
            }

            for delivery in batch {
                if stop_requested(&self.shutdown) {
                    return Ok(());
                }

                let offset = delivery.offset;
                let mut context =
                    MessageContext::new(Arc::clone(&stream), self.name.clone(), offset);
                if let Err(source) = self.handler.handle(&mut context, &delivery.record) {
                    return Err(Error::handler_failed(stream.as_ref(), offset, source));
                }
                tracing::trace!(stream = %stream, offset, "Record handled");

                tracking.record_delivered(offset);
                position = offset.saturating_add(1);
                report.delivered = report.delivered.saturating_add(1);
                report.last_delivered = Some(offset);

                if context.store_requested {
                    let stored = self.store_requested(&mut tracking, offset).await?;
                    report.last_stored = tracking.last_stored();
                    if !stored {
                        return Ok(());
                    }
                } else if self.tracking.should_store(&tracking) {
                    self.store(&mut tracking, offset).await;
                    report.last_stored = tracking.last_stored();
                }
                if context.stop_requested {
                    return Ok(());
                }
            }
        }
    }

    /// Position after the stored offset, or the configured spec when none is stored.
    async fn resolve_start(&mut self) -> Result<Option<(Offset, TrackingState)>> {
        let broker = Arc::clone(&self.broker);
        let stream = Arc::clone(&self.stream);

        if let Some(name) = self.name.clone() {
            let Some(stored) = retrying(&self.retry, &mut self.shutdown, &stream, "fetch offset", || {
                broker.fetch_consumer_offset(&name, &stream)
            })
            .await?
            else {
                return Ok(None);
            };

            if let Some(stored) = stored {
                tracing::info!(
                    stream = %stream,
                    consumer = %name,
                    stored,
                    "Resuming after stored offset"
                );
                return Ok(Some((stored.saturating_add(1), TrackingState::resumed(stored))));
            }
        }

        let Some(bounds) = retrying(&self.retry, &mut self.shutdown, &stream, "bounds", || {
            broker.stream_bounds(&stream)
        })
        .await?
        else {
            return Ok(None);
        };
        let position = self.offset.resolve(bounds);
        tracing::info!(
            stream = %stream,
            consumer = ?self.name,
            spec = %self.offset,
            position,
            "No stored offset, starting from spec"
        );
        Ok(Some((position, TrackingState::new())))
    }

    /// Store an offset the handler asked for, retrying transient failures
    /// until it succeeds. Returns `false` if a stop arrived first.
    async fn store_requested(&mut self, tracking: &mut TrackingState, offset: Offset) -> Result<bool> {
        let Some(name) = self.name.clone() else {
            return Ok(true);
        };
        if !tracking.can_store(offset) {
            return Ok(true);
        }

        let broker = Arc::clone(&self.broker);
        let stream = Arc::clone(&self.stream);
        let stored = retrying(&self.retry, &mut self.shutdown, &stream, "store offset", || {
            broker.store_consumer_offset(&name, &stream, offset)
        })
        .await?;

        if stored.is_none() {
            tracing::warn!(
                stream = %stream,
                consumer = %name,
                offset,
                "Consumer closed before requested offset was stored"
            );
            return Ok(false);
        }
        tracking.mark_stored(offset);
        tracing::debug!(stream = %stream, consumer = %name, offset, "Requested offset stored");
        Ok(true)
    }

    /// Store `offset`. A failure leaves the checkpoint due so the next record retries it.
    async fn store(&mut self, tracking: &mut TrackingState, offset: Offset) {
        let Some(name) = self.name.as_deref() else {
            return;
        };
        if !tracking.can_store(offset) {
            return;
        }
        match self
            .broker
            .store_consumer_offset(name, &self.stream, offset)
            .await
        {
            Ok(()) => {
                tracking.mark_stored(offset);
                tracing::debug!(stream = %self.stream, consumer = %name, offset, "Offset stored");
            }
            Err(e) => tracing::warn!(
                stream = %self.stream,
                consumer = %name,
                offset,
                error = %e,
                "Failed to store offset, retrying at next checkpoint"
            ),
        }
    }
}

/// Run `operation` until it succeeds, retrying transient errors with backoff.
///
/// Returns `Ok(None)` if a stop is requested while waiting.
async fn retrying<T, F, Fut>(
    retry: &RetryConfig,
    shutdown: &mut watch::Receiver<bool>,
    stream: &str,
    operation: &str,
    mut attempt_fn: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0_u32;
    loop {
        if stop_requested(shutdown) {
            return Ok(None);
        }
        match attempt_fn().await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_transient() => {
                let delay = retry.backoff(attempt);
                tracing::warn!(
                    stream,
                    operation,
                    attempt,
                    delay = ?delay,
                    error = %e,
                    "Transient broker failure, retrying"
                );
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::types::StreamOptions;

    async fn broker_with_records(stream: &str, count: u64) -> Arc<InMemoryBroker> {
        let broker = InMemoryBroker::new_arc();
        broker
            .create_stream(stream, StreamOptions::default())
            .await
            .unwrap();
        for i in 0..count {
            broker
                .append(stream, None, None, Record::new(format!("message {i}")))
                .await
                .unwrap();
        }
        broker
    }

    fn stop_after(count: u64) -> impl MessageHandler {
        let mut seen = 0;
        move |ctx: &mut MessageContext, _: &Record| -> anyhow::Result<()> {
            seen += 1;
            if seen == count {
                ctx.stop();
            }
            Ok(())
        }
    }

    // ==========================================================================
    // Config BEHAVIORAL TESTS
    // ==========================================================================

    #[test]
    fn should_cap_backoff_at_maximum() {
        let retry = RetryConfig::default();

        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(10), Duration::from_secs(5));
        assert_eq!(retry.backoff(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn should_require_name_for_periodic_tracking() {
        let unnamed = ConsumerConfig::new("s").with_tracking(TrackingPolicy::periodic(3));
        let named = unnamed.clone().with_name("c1");

        assert!(matches!(unnamed.validate(), Err(Error::InvalidConfig { .. })));
        assert!(named.validate().is_ok());
    }

    #[test]
    fn should_reject_bad_consumer_config() {
        assert!(ConsumerConfig::new(" ").validate().is_err());
        assert!(ConsumerConfig::new("s").with_batch_size(0).validate().is_err());
        assert!(
            ConsumerConfig::new("s")
                .with_retry(RetryConfig::new(Duration::from_secs(2), Duration::from_secs(1)))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn should_deserialize_consumer_config_with_defaults() {
        let config: ConsumerConfig = serde_json::from_str(
            r#"{"stream":"s","name":"c1","offset":{"offset":5},"tracking":{"strategy":"periodic","every":3}}"#,
        )
        .unwrap();

        assert_eq!(config.offset, OffsetSpec::Offset(5));
        assert_eq!(config.tracking, TrackingPolicy::periodic(3));
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn should_refuse_store_without_name() {
        let mut ctx = MessageContext::new(Arc::from("s"), None, 3);
        assert!(matches!(ctx.store_offset(), Err(Error::UnnamedConsumer { .. })));
        assert!(!ctx.store_requested);
    }

    // ==========================================================================
    // Delivery BEHAVIORAL TESTS
    // ==========================================================================

    #[tokio::test]
    async fn should_deliver_in_offset_order_from_first() {
        let broker = broker_with_records("s", 5).await;
        let mut offsets = Vec::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let consumer = Consumer::subscribe(
            broker,
            ConsumerConfig::new("s").with_batch_size(2),
            move |ctx: &mut MessageContext, record: &Record| -> anyhow::Result<()> {
                tx.send((ctx.offset(), record.body_str().map(str::to_string)))?;
                if ctx.offset() == 4 {
                    ctx.stop();
                }
                Ok(())
            },
        )
        .unwrap();

        let report = consumer.join().await.unwrap();
        while let Ok((offset, body)) = rx.try_recv() {
            assert_eq!(body, Some(format!("message {offset}")));
            offsets.push(offset);
        }
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert_eq!(report.delivered, 5);
        assert_eq!(report.last_delivered, Some(4));
        assert_eq!(report.last_stored, None);
    }

    #[tokio::test]
    async fn should_start_from_numeric_offset() {
        let broker = broker_with_records("s", 10).await;
        let first_seen = Arc::new(std::sync::Mutex::new(None));
        let seen = Arc::clone(&first_seen);

        let consumer = Consumer::subscribe(
            broker,
            ConsumerConfig::new("s").with_offset(OffsetSpec::Offset(7)),
            move |ctx: &mut MessageContext, _: &Record| -> anyhow::Result<()> {
                seen.lock().unwrap().get_or_insert(ctx.offset());
                ctx.stop();
                Ok(())
            },
        )
        .unwrap();

        consumer.join().await.unwrap();
        assert_eq!(*first_seen.lock().unwrap(), Some(7));
    }

    #[tokio::test]
    async fn should_wait_for_new_records_at_tail() {
        let broker = broker_with_records("s", 0).await;
        let consumer = Consumer::subscribe(
            broker.clone(),
            ConsumerConfig::new("s").with_offset(OffsetSpec::Next),
            stop_after(2),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.append("s", None, None, Record::new("a")).await.unwrap();
        broker.append("s", None, None, Record::new("b")).await.unwrap();

        let report = consumer.join().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.last_delivered, Some(1));
    }

    #[tokio::test]
    async fn should_stop_when_closed_while_idle() {
        let broker = broker_with_records("s", 0).await;
        let consumer =
            Consumer::subscribe(broker, ConsumerConfig::new("s"), stop_after(u64::MAX)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = consumer.close().await.unwrap();

        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn should_stop_through_cloned_handle() {
        let broker = broker_with_records("s", 0).await;
        let consumer =
            Consumer::subscribe(broker, ConsumerConfig::new("s"), stop_after(u64::MAX)).unwrap();
        let handle = consumer.handle();

        handle.close();

        assert!(handle.is_closing());
        assert!(consumer.join().await.is_ok());
    }

    #[tokio::test]
    async fn should_store_requested_offset_after_handler_returns() {
        let broker = broker_with_records("s", 3).await;
        let consumer = Consumer::subscribe(
            broker.clone(),
            ConsumerConfig::new("s").with_name("c1"),
            |ctx: &mut MessageContext, record: &Record| -> anyhow::Result<()> {
                if record.body_str() == Some("message 1") {
                    ctx.store_offset()?;
                    ctx.stop();
                }
                Ok(())
            },
        )
        .unwrap();

        let report = consumer.join().await.unwrap();

        assert_eq!(report.last_stored, Some(1));
        assert_eq!(broker.fetch_consumer_offset("c1", "s").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn should_fail_stop_on_handler_error() {
        let broker = broker_with_records("s", 5).await;
        let consumer = Consumer::subscribe(
            broker,
            ConsumerConfig::new("s").with_name("c1"),
            |ctx: &mut MessageContext, _: &Record| -> anyhow::Result<()> {
                if ctx.offset() == 2 {
                    anyhow::bail!("cannot parse record");
                }
                ctx.store_offset()?;
                Ok(())
            },
        )
        .unwrap();

        let err = consumer.join().await.unwrap_err();

        assert!(matches!(err, Error::HandlerFailed { offset: 2, .. }));
    }

    #[tokio::test]
    async fn should_report_closed_state_after_join() {
        let broker = broker_with_records("s", 1).await;
        let consumer =
            Consumer::subscribe(broker, ConsumerConfig::new("s"), stop_after(1)).unwrap();
        let state = consumer.state.clone();

        consumer.join().await.unwrap();

        assert_eq!(*state.borrow(), ConsumerState::Closed);
    }

    #[tokio::test]
    async fn should_fail_when_stream_missing() {
        let broker = InMemoryBroker::new_arc();
        let consumer =
            Consumer::subscribe(broker, ConsumerConfig::new("missing"), stop_after(1)).unwrap();

        let err = consumer.join().await.unwrap_err();

        assert!(err.is_stream_not_found());
    }
}
