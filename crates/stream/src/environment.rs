//! Entry point tying a broker to producers and consumers.

use std::sync::Arc;

use crate::broker::{InMemoryBroker, StreamBroker, TracingBroker};
use crate::consumer::{Consumer, ConsumerConfig, MessageHandler};
use crate::error::Result;
use crate::producer::{Producer, ProducerConfig};
use crate::types::{Offset, StreamBounds, StreamOptions};

/// Shared access to one broker.
///
/// ```
/// # async fn example() -> rill_stream::Result<()> {
/// use rill_stream::{Environment, ProducerConfig, Record, StreamOptions};
///
/// let env = Environment::in_memory();
/// env.create_stream("orders", StreamOptions::default()).await?;
///
/// let producer = env.producer(ProducerConfig::new("orders").with_name("app-1")).await?;
/// let status = producer.send_with_confirm(Record::new("hello").with_publishing_id(0)).await?;
/// assert!(status.is_confirmed());
/// producer.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Environment {
    broker: Arc<dyn StreamBroker>,
}

impl Environment {
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self { broker }
    }

    /// An environment over a fresh in-memory broker with call tracing.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(TracingBroker::new(InMemoryBroker::new())))
    }

    pub fn broker(&self) -> &Arc<dyn StreamBroker> {
        &self.broker
    }

    /// # Errors
    /// Returns `Error::StreamAlreadyExists` if the stream exists.
    pub async fn create_stream(&self, stream: &str, options: StreamOptions) -> Result<()> {
        self.broker.create_stream(stream, options).await?;
        tracing::info!(stream, "Stream created");
        Ok(())
    }

    /// # Errors
    /// Returns `Error::StreamNotFound` if the stream does not exist.
    pub async fn delete_stream(&self, stream: &str) -> Result<()> {
        self.broker.delete_stream(stream).await?;
        tracing::info!(stream, "Stream deleted");
        Ok(())
    }

    /// Delete a stream, treating a missing stream as success.
    ///
    /// Returns whether a stream was deleted.
    ///
    /// # Errors
    /// Any failure other than the stream not existing.
    pub async fn delete_stream_if_exists(&self, stream: &str) -> Result<bool> {
        match self.delete_stream(stream).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_stream_not_found() => {
                tracing::info!(stream, "Stream does not exist, nothing to delete");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// # Errors
    /// Returns `Error::StreamNotFound` if the stream does not exist.
    pub async fn stream_bounds(&self, stream: &str) -> Result<StreamBounds> {
        self.broker.stream_bounds(stream).await
    }

    /// Open a producer. See [`Producer::open`].
    ///
    /// # Errors
    /// Returns an error for an invalid config or a missing stream.
    pub async fn producer(&self, config: ProducerConfig) -> Result<Producer> {
        Producer::open(Arc::clone(&self.broker), config).await
    }

    /// Subscribe a consumer. See [`Consumer::subscribe`].
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for an invalid config.
    pub fn consumer<H: MessageHandler>(&self, config: ConsumerConfig, handler: H) -> Result<Consumer> {
        Consumer::subscribe(Arc::clone(&self.broker), config, handler)
    }

    /// Offset stored under `consumer` for `stream`, if any.
    ///
    /// # Errors
    /// Returns `Error::StreamNotFound` if the stream does not exist.
    pub async fn stored_offset(&self, consumer: &str, stream: &str) -> Result<Option<Offset>> {
        self.broker.fetch_consumer_offset(consumer, stream).await
    }
}
