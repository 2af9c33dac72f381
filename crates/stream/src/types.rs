//! Core types shared by producers, consumers and brokers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::Record;

/// Position of a record within a stream, assigned by the broker at append time.
pub type Offset = u64;

/// Producer-assigned sequence number, used by the broker as a deduplication key.
pub type PublishingId = u64;

/// Where a consumer starts reading when no stored offset exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetSpec {
    /// The first record still retained by the stream.
    #[default]
    First,
    /// The most recent record, or the next one if the stream is empty.
    Last,
    /// Only records appended after the subscription starts.
    Next,
    /// A specific offset. Offsets evicted by retention resolve to the first retained record.
    Offset(Offset),
}

impl OffsetSpec {
    /// Resolve this specification against the current bounds of a stream.
    #[must_use]
    pub fn resolve(self, bounds: StreamBounds) -> Offset {
        match self {
            Self::First => bounds.first,
            Self::Last => bounds.last().unwrap_or(bounds.next),
            Self::Next => bounds.next,
            Self::Offset(offset) => offset.max(bounds.first),
        }
    }
}

impl fmt::Display for OffsetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Last => write!(f, "last"),
            Self::Next => write!(f, "next"),
            Self::Offset(offset) => write!(f, "{offset}"),
        }
    }
}

impl FromStr for OffsetSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "next" => Ok(Self::Next),
            other => other.parse::<Offset>().map(Self::Offset).map_err(|_| {
                Error::invalid_config(format!(
                    "offset specification '{s}' must be first, last, next or a number"
                ))
            }),
        }
    }
}

/// Retained offset range of a stream: `[first, next)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamBounds {
    /// Offset of the oldest retained record.
    pub first: Offset,
    /// Offset the next appended record will receive.
    pub next: Offset,
}

impl StreamBounds {
    #[must_use]
    pub const fn new(first: Offset, next: Offset) -> Self {
        Self { first, next }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.first >= self.next
    }

    /// Offset of the newest record, if any.
    #[must_use]
    pub const fn last(&self) -> Option<Offset> {
        if self.is_empty() {
            None
        } else {
            self.next.checked_sub(1)
        }
    }

    /// Number of retained records.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.next.saturating_sub(self.first)
    }
}

/// Options applied when creating a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Evict the oldest records once the retained bodies exceed this many bytes.
    #[serde(default)]
    pub max_length_bytes: Option<u64>,
}

impl StreamOptions {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_length_bytes: None,
        }
    }

    /// Set the retention limit in bytes.
    #[must_use]
    pub const fn with_max_length_bytes(mut self, bytes: u64) -> Self {
        self.max_length_bytes = Some(bytes);
        self
    }

    /// Validate the options.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for a zero retention limit.
    pub fn validate(&self) -> Result<()> {
        match self.max_length_bytes {
            Some(0) => Err(Error::invalid_config("max_length_bytes must be positive")),
            _ => Ok(()),
        }
    }
}

/// A record read back from a stream together with its offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub offset: Offset,
    pub record: Record,
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
