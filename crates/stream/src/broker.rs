//! The log service producers and consumers talk to.
//!
//! [`StreamBroker`] is the narrow surface the producer and consumer need:
//! stream administration, append with deduplication, offset-addressed reads,
//! and the durable per-name stores for publishing ids and consumer offsets.
//! [`InMemoryBroker`] is a complete in-process implementation used by tests
//! and the command-line front end.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};

use crate::error::{Error, Result};
use crate::record::Record;
use crate::types::{Delivery, Offset, PublishingId, StreamBounds, StreamOptions};

/// Result of appending one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored at the given offset.
    Stored(Offset),
    /// Same producer name and publishing id already stored; nothing appended.
    Duplicate,
}

/// Trait for stream broker backends.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create a stream.
    async fn create_stream(&self, stream: &str, options: StreamOptions) -> Result<()>;

    /// Delete a stream with its records and tracking state.
    ///
    /// Fails with `Error::StreamNotFound` if the stream does not exist.
    async fn delete_stream(&self, stream: &str) -> Result<()>;

    /// Current retained offset range.
    async fn stream_bounds(&self, stream: &str) -> Result<StreamBounds>;

    /// Append a record.
    ///
    /// Deduplication applies only when both `producer` and `publishing_id`
    /// are given.
    async fn append(
        &self,
        stream: &str,
        producer: Option<&str>,
        publishing_id: Option<PublishingId>,
        record: Record,
    ) -> Result<AppendOutcome>;

    /// Read at most `max` records starting at `from`, in offset order.
    async fn read(&self, stream: &str, from: Offset, max: usize) -> Result<Vec<Delivery>>;

    /// Watch the next offset to be assigned. The sender goes away with the stream.
    async fn watch_tail(&self, stream: &str) -> Result<watch::Receiver<Offset>>;

    /// Highest publishing id stored for a producer name on a stream.
    async fn fetch_last_publishing_id(
        &self,
        producer: &str,
        stream: &str,
    ) -> Result<Option<PublishingId>>;

    /// Persist a consumer offset. The stored value never decreases.
    async fn store_consumer_offset(&self, consumer: &str, stream: &str, offset: Offset)
    -> Result<()>;

    /// Last offset stored for a consumer name on a stream.
    async fn fetch_consumer_offset(&self, consumer: &str, stream: &str) -> Result<Option<Offset>>;
}

#[async_trait]
impl<T: StreamBroker + ?Sized> StreamBroker for Arc<T> {
    async fn create_stream(&self, stream: &str, options: StreamOptions) -> Result<()> {
        (**self).create_stream(stream, options).await
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        (**self).delete_stream(stream).await
    }

    async fn stream_bounds(&self, stream: &str) -> Result<StreamBounds> {
        (**self).stream_bounds(stream).await
    }

    async fn append(
        &self,
        stream: &str,
        producer: Option<&str>,
        publishing_id: Option<PublishingId>,
        record: Record,
    ) -> Result<AppendOutcome> {
        (**self).append(stream, producer, publishing_id, record).await
    }

    async fn read(&self, stream: &str, from: Offset, max: usize) -> Result<Vec<Delivery>> {
        (**self).read(stream, from, max).await
    }

    async fn watch_tail(&self, stream: &str) -> Result<watch::Receiver<Offset>> {
        (**self).watch_tail(stream).await
    }

    async fn fetch_last_publishing_id(
        &self,
        producer: &str,
        stream: &str,
    ) -> Result<Option<PublishingId>> {
        (**self).fetch_last_publishing_id(producer, stream).await
    }

    async fn store_consumer_offset(
        &self,
        consumer: &str,
        stream: &str,
        offset: Offset,
    ) -> Result<()> {
        (**self).store_consumer_offset(consumer, stream, offset).await
    }

    async fn fetch_consumer_offset(&self, consumer: &str, stream: &str) -> Result<Option<Offset>> {
        (**self).fetch_consumer_offset(consumer, stream).await
    }
}

struct StreamLog {
    options: StreamOptions,
    first: Offset,
    records: VecDeque<Record>,
    retained_bytes: u64,
    publishers: HashMap<String, PublishingId>,
    tail: watch::Sender<Offset>,
}

impl StreamLog {
    fn new(options: StreamOptions, first: Offset) -> Self {
        let (tail, _) = watch::channel(first);
        Self {
            options,
            first,
            records: VecDeque::new(),
            retained_bytes: 0,
            publishers: HashMap::new(),
            tail,
        }
    }

    fn next_offset(&self) -> Offset {
        self.first.saturating_add(self.records.len() as u64)
    }

    fn bounds(&self) -> StreamBounds {
        StreamBounds::new(self.first, self.next_offset())
    }

    fn append(
        &mut self,
        producer: Option<&str>,
        publishing_id: Option<PublishingId>,
        record: Record,
    ) -> AppendOutcome {
        if let (Some(producer), Some(id)) = (producer, publishing_id) {
            if self.publishers.get(producer).is_some_and(|last| id <= *last) {
                return AppendOutcome::Duplicate;
            }
            self.publishers.insert(producer.to_string(), id);
        }

        let offset = self.next_offset();
        self.retained_bytes = self.retained_bytes.saturating_add(record.len() as u64);
        self.records.push_back(record);
        self.evict();
        self.tail.send_replace(self.next_offset());
        AppendOutcome::Stored(offset)
    }

    /// Drop the oldest records while over the byte limit, always keeping the newest.
    fn evict(&mut self) {
        let Some(max) = self.options.max_length_bytes else {
            return;
        };
        while self.retained_bytes > max && self.records.len() > 1 {
            if let Some(evicted) = self.records.pop_front() {
                self.retained_bytes = self.retained_bytes.saturating_sub(evicted.len() as u64);
                self.first = self.first.saturating_add(1);
            }
        }
    }

    fn read(&self, from: Offset, max: usize) -> Vec<Delivery> {
        let start = from.max(self.first);
        let skip = usize::try_from(start.saturating_sub(self.first)).unwrap_or(usize::MAX);
        self.records
            .iter()
            .skip(skip)
            .take(max)
            .zip(start..)
            .map(|(record, offset)| Delivery {
                offset,
                record: record.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    failing_reads: AtomicU32,
    failing_appends: AtomicU32,
}

impl Faults {
    fn check(&self, stream: &str) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::unavailable(stream, "broker unavailable"));
        }
        Ok(())
    }

    fn check_counted(&self, counter: &AtomicU32, stream: &str, operation: &str) -> Result<()> {
        self.check(stream)?;
        if counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::unavailable(
                stream,
                format!("injected {operation} failure"),
            ));
        }
        Ok(())
    }
}

/// In-memory stream broker.
#[derive(Default)]
pub struct InMemoryBroker {
    streams: RwLock<HashMap<String, StreamLog>>,
    consumer_offsets: RwLock<HashMap<(String, String), Offset>>,
    faults: Faults,
}

impl InMemoryBroker {
    /// Create a new, empty in-memory broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory broker wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every operation fail with a transient `Unavailable` error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::Release);
    }

    /// Fail the next `n` reads with a transient error.
    pub fn fail_next_reads(&self, n: u32) {
        self.faults.failing_reads.store(n, Ordering::Release);
    }

    /// Fail the next `n` appends with a transient error.
    pub fn fail_next_appends(&self, n: u32) {
        self.faults.failing_appends.store(n, Ordering::Release);
    }

    /// Copy the full broker state.
    pub async fn snapshot(&self) -> BrokerSnapshot {
        let streams = self.streams.read().await;
        let mut stream_snapshots: Vec<StreamSnapshot> = streams
            .iter()
            .map(|(name, log)| StreamSnapshot {
                name: name.clone(),
                options: log.options,
                first: log.first,
                records: log.records.iter().cloned().collect(),
                publishers: log
                    .publishers
                    .iter()
                    .map(|(producer, id)| (producer.clone(), *id))
                    .collect(),
            })
            .collect();
        stream_snapshots.sort_by(|a, b| a.name.cmp(&b.name));

        let offsets = self.consumer_offsets.read().await;
        let mut consumer_offsets: Vec<ConsumerOffsetSnapshot> = offsets
            .iter()
            .map(|((consumer, stream), offset)| ConsumerOffsetSnapshot {
                consumer: consumer.clone(),
                stream: stream.clone(),
                offset: *offset,
            })
            .collect();
        consumer_offsets.sort_by(|a, b| (&a.stream, &a.consumer).cmp(&(&b.stream, &b.consumer)));

        BrokerSnapshot {
            streams: stream_snapshots,
            consumer_offsets,
        }
    }

    /// Rebuild a broker from a snapshot.
    pub fn from_snapshot(snapshot: BrokerSnapshot) -> Self {
        let streams = snapshot
            .streams
            .into_iter()
            .map(|stream| {
                let mut log = StreamLog::new(stream.options, stream.first);
                log.retained_bytes = stream.records.iter().map(|r| r.len() as u64).sum();
                log.records = stream.records.into();
                log.publishers = stream.publishers.into_iter().collect();
                log.tail.send_replace(log.next_offset());
                (stream.name, log)
            })
            .collect();
        let consumer_offsets = snapshot
            .consumer_offsets
            .into_iter()
            .map(|entry| ((entry.consumer, entry.stream), entry.offset))
            .collect();

        Self {
            streams: RwLock::new(streams),
            consumer_offsets: RwLock::new(consumer_offsets),
            faults: Faults::default(),
        }
    }
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn create_stream(&self, stream: &str, options: StreamOptions) -> Result<()> {
        self.faults.check(stream)?;
        options.validate()?;

        let mut streams = self.streams.write().await;
        if streams.contains_key(stream) {
            return Err(Error::stream_already_exists(stream));
        }
        streams.insert(stream.to_string(), StreamLog::new(options, 0));
        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        self.faults.check(stream)?;

        let mut streams = self.streams.write().await;
        if streams.remove(stream).is_none() {
            return Err(Error::stream_not_found(stream));
        }
        drop(streams);

        let mut offsets = self.consumer_offsets.write().await;
        offsets.retain(|(_, offset_stream), _| offset_stream != stream);
        Ok(())
    }

    async fn stream_bounds(&self, stream: &str) -> Result<StreamBounds> {
        self.faults.check(stream)?;

        let streams = self.streams.read().await;
        streams
            .get(stream)
            .map(StreamLog::bounds)
            .ok_or_else(|| Error::stream_not_found(stream))
    }

    async fn append(
        &self,
        stream: &str,
        producer: Option<&str>,
        publishing_id: Option<PublishingId>,
        record: Record,
    ) -> Result<AppendOutcome> {
        self.faults
            .check_counted(&self.faults.failing_appends, stream, "append")?;

        let mut streams = self.streams.write().await;
        let log = streams
            .get_mut(stream)
            .ok_or_else(|| Error::stream_not_found(stream))?;
        Ok(log.append(producer, publishing_id, record))
    }

    async fn read(&self, stream: &str, from: Offset, max: usize) -> Result<Vec<Delivery>> {
        self.faults
            .check_counted(&self.faults.failing_reads, stream, "read")?;

        let streams = self.streams.read().await;
        streams
            .get(stream)
            .map(|log| log.read(from, max))
            .ok_or_else(|| Error::stream_not_found(stream))
    }

    async fn watch_tail(&self, stream: &str) -> Result<watch::Receiver<Offset>> {
        self.faults.check(stream)?;

        let streams = self.streams.read().await;
        streams
            .get(stream)
            .map(|log| log.tail.subscribe())
            .ok_or_else(|| Error::stream_not_found(stream))
    }

    async fn fetch_last_publishing_id(
        &self,
        producer: &str,
        stream: &str,
    ) -> Result<Option<PublishingId>> {
        self.faults.check(stream)?;

        let streams = self.streams.read().await;
        streams
            .get(stream)
            .map(|log| log.publishers.get(producer).copied())
            .ok_or_else(|| Error::stream_not_found(stream))
    }

    async fn store_consumer_offset(
        &self,
        consumer: &str,
        stream: &str,
        offset: Offset,
    ) -> Result<()> {
        self.faults.check(stream)?;

        if !self.streams.read().await.contains_key(stream) {
            return Err(Error::stream_not_found(stream));
        }
        let mut offsets = self.consumer_offsets.write().await;
        offsets
            .entry((consumer.to_string(), stream.to_string()))
            .and_modify(|stored| *stored = (*stored).max(offset))
            .or_insert(offset);
        Ok(())
    }

    async fn fetch_consumer_offset(&self, consumer: &str, stream: &str) -> Result<Option<Offset>> {
        self.faults.check(stream)?;

        if !self.streams.read().await.contains_key(stream) {
            return Err(Error::stream_not_found(stream));
        }
        let offsets = self.consumer_offsets.read().await;
        Ok(offsets
            .get(&(consumer.to_string(), stream.to_string()))
            .copied())
    }
}

/// A wrapper that adds tracing to a stream broker.
pub struct TracingBroker<B: StreamBroker> {
    inner: B,
}

impl<B: StreamBroker> TracingBroker<B> {
    /// Create a new tracing broker.
    pub const fn new(inner: B) -> Self {
        Self { inner }
    }

    /// The wrapped broker.
    pub const fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: StreamBroker> StreamBroker for TracingBroker<B> {
    async fn create_stream(&self, stream: &str, options: StreamOptions) -> Result<()> {
        tracing::debug!(stream, ?options, "Creating stream");
        self.inner.create_stream(stream, options).await
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        tracing::debug!(stream, "Deleting stream");
        self.inner.delete_stream(stream).await
    }

    async fn stream_bounds(&self, stream: &str) -> Result<StreamBounds> {
        self.inner.stream_bounds(stream).await
    }

    async fn append(
        &self,
        stream: &str,
        producer: Option<&str>,
        publishing_id: Option<PublishingId>,
        record: Record,
    ) -> Result<AppendOutcome> {
        tracing::trace!(stream, producer, publishing_id, bytes = record.len(), "Appending record");
        let result = self.inner.append(stream, producer, publishing_id, record).await;
        match &result {
            Ok(AppendOutcome::Stored(offset)) => {
                tracing::trace!(stream, offset, "Record stored");
            }
            Ok(AppendOutcome::Duplicate) => {
                tracing::debug!(stream, producer, publishing_id, "Duplicate record skipped");
            }
            Err(e) => tracing::debug!(stream, error = %e, "Append failed"),
        }
        result
    }

    async fn read(&self, stream: &str, from: Offset, max: usize) -> Result<Vec<Delivery>> {
        tracing::trace!(stream, from, max, "Reading records");
        self.inner.read(stream, from, max).await
    }

    async fn watch_tail(&self, stream: &str) -> Result<watch::Receiver<Offset>> {
        self.inner.watch_tail(stream).await
    }

    async fn fetch_last_publishing_id(
        &self,
        producer: &str,
        stream: &str,
    ) -> Result<Option<PublishingId>> {
        let result = self.inner.fetch_last_publishing_id(producer, stream).await;
        if let Ok(id) = &result {
            tracing::debug!(stream, producer, last_publishing_id = ?id, "Fetched last publishing id");
        }
        result
    }

    async fn store_consumer_offset(
        &self,
        consumer: &str,
        stream: &str,
        offset: Offset,
    ) -> Result<()> {
        tracing::debug!(stream, consumer, offset, "Storing consumer offset");
        self.inner.store_consumer_offset(consumer, stream, offset).await
    }

    async fn fetch_consumer_offset(&self, consumer: &str, stream: &str) -> Result<Option<Offset>> {
        let result = self.inner.fetch_consumer_offset(consumer, stream).await;
        if let Ok(offset) = &result {
            tracing::debug!(stream, consumer, stored_offset = ?offset, "Fetched consumer offset");
        }
        result
    }
}

/// Serializable copy of an [`InMemoryBroker`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    #[serde(default)]
    pub streams: Vec<StreamSnapshot>,
    #[serde(default)]
    pub consumer_offsets: Vec<ConsumerOffsetSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub name: String,
    #[serde(default)]
    pub options: StreamOptions,
    #[serde(default)]
    pub first: Offset,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub publishers: BTreeMap<String, PublishingId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOffsetSnapshot {
    pub consumer: String,
    pub stream: String,
    pub offset: Offset,
}
