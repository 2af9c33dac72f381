//! Error types for the stream crate.

use std::time::Duration;

use thiserror::Error;

use crate::types::{Offset, PublishingId};

/// Result type alias for stream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stream error types.
#[derive(Debug, Error)]
pub enum Error {
    /// The stream does not exist. Non-fatal when deleting.
    #[error("stream '{stream}' does not exist")]
    StreamNotFound { stream: String },

    #[error("stream '{stream}' already exists")]
    StreamAlreadyExists { stream: String },

    /// The broker could not serve the request right now. Retried by consumers.
    #[error("stream '{stream}' is unavailable: {reason}")]
    Unavailable { stream: String, reason: String },

    #[error("producer on stream '{stream}' is closed")]
    ProducerClosed { stream: String },

    #[error(
        "publishing id {attempted} is lower than {highest} already used by producer '{producer}' on stream '{stream}'"
    )]
    PublishingIdRegression {
        producer: String,
        stream: String,
        highest: PublishingId,
        attempted: PublishingId,
    },

    #[error("producer on stream '{stream}' has no name, deduplication state is unavailable")]
    UnnamedProducer { stream: String },

    #[error("consumer on stream '{stream}' has no name to store offsets under")]
    UnnamedConsumer { stream: String },

    /// A message handler returned an error. Delivery stopped at `offset`.
    #[error("handler failed at offset {offset} on stream '{stream}': {source}")]
    HandlerFailed {
        stream: String,
        offset: Offset,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid state transition from '{current}' to '{attempted}'")]
    InvalidState { current: String, attempted: String },

    #[error("{message} (waited {waited:?})")]
    ConditionTimeout { waited: Duration, message: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a stream not found error.
    pub fn stream_not_found(stream: impl Into<String>) -> Self {
        Self::StreamNotFound {
            stream: stream.into(),
        }
    }

    /// Create a stream already exists error.
    pub fn stream_already_exists(stream: impl Into<String>) -> Self {
        Self::StreamAlreadyExists {
            stream: stream.into(),
        }
    }

    /// Create a transient unavailability error.
    pub fn unavailable(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            stream: stream.into(),
            reason: reason.into(),
        }
    }

    /// Create a producer closed error.
    pub fn producer_closed(stream: impl Into<String>) -> Self {
        Self::ProducerClosed {
            stream: stream.into(),
        }
    }

    /// Create a publishing id regression error.
    pub fn publishing_id_regression(
        producer: impl Into<String>,
        stream: impl Into<String>,
        highest: PublishingId,
        attempted: PublishingId,
    ) -> Self {
        Self::PublishingIdRegression {
            producer: producer.into(),
            stream: stream.into(),
            highest,
            attempted,
        }
    }

    /// Create an unnamed producer error.
    pub fn unnamed_producer(stream: impl Into<String>) -> Self {
        Self::UnnamedProducer {
            stream: stream.into(),
        }
    }

    /// Create an unnamed consumer error.
    pub fn unnamed_consumer(stream: impl Into<String>) -> Self {
        Self::UnnamedConsumer {
            stream: stream.into(),
        }
    }

    /// Create a handler failed error.
    pub fn handler_failed(stream: impl Into<String>, offset: Offset, source: anyhow::Error) -> Self {
        Self::HandlerFailed {
            stream: stream.into(),
            offset,
            source,
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid state transition error.
    pub fn invalid_state(current: impl Into<String>, attempted: impl Into<String>) -> Self {
        Self::InvalidState {
            current: current.into(),
            attempted: attempted.into(),
        }
    }

    /// Create a condition timeout error.
    pub fn condition_timeout(waited: Duration, message: impl Into<String>) -> Self {
        Self::ConditionTimeout {
            waited,
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Whether this is the "stream does not exist" condition.
    #[must_use]
    pub const fn is_stream_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound { .. })
    }

    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
