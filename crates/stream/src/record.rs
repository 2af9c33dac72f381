//! The record carried between producers and consumers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::PublishingId;

/// Application-level message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(u64),
    Text(String),
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::Text(id) => write!(f, "{id}"),
        }
    }
}

/// Standard message properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// An opaque payload plus optional metadata.
///
/// Built once with the `with_*` methods, read-only afterwards.
///
/// ```
/// use rill_stream::Record;
///
/// let record = Record::new("message 3")
///     .with_message_id(3_u64)
///     .with_content_type("text/plain")
///     .with_publishing_id(3);
///
/// assert_eq!(record.body_str(), Some("message 3"));
/// assert_eq!(record.publishing_id(), Some(3));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    body: Vec<u8>,
    #[serde(default)]
    properties: Properties,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    application_properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    message_annotations: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    publishing_id: Option<PublishingId>,
}

impl Record {
    /// Create a record with the given body and no metadata.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: Properties::default(),
            application_properties: BTreeMap::new(),
            message_annotations: BTreeMap::new(),
            publishing_id: None,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<MessageId>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_creation_time(mut self, time: DateTime<Utc>) -> Self {
        self.properties.creation_time = Some(time);
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_application_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_message_annotation(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.message_annotations.insert(key.into(), value.into());
        self
    }

    /// Set the deduplication key. Only honored by named producers.
    #[must_use]
    pub fn with_publishing_id(mut self, id: PublishingId) -> Self {
        self.publishing_id = Some(id);
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as UTF-8, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    pub const fn message_id(&self) -> Option<&MessageId> {
        self.properties.message_id.as_ref()
    }

    pub const fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.properties.creation_time
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type.as_deref()
    }

    pub fn application_property(&self, key: &str) -> Option<&Value> {
        self.application_properties.get(key)
    }

    pub const fn application_properties(&self) -> &BTreeMap<String, Value> {
        &self.application_properties
    }

    pub fn message_annotation(&self, key: &str) -> Option<&Value> {
        self.message_annotations.get(key)
    }

    pub const fn message_annotations(&self) -> &BTreeMap<String, Value> {
        &self.message_annotations
    }

    pub const fn publishing_id(&self) -> Option<PublishingId> {
        self.publishing_id
    }

    /// Size of the body in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn should_build_record_with_metadata() {
        let now = Utc::now();
        let record = Record::new(b"first wave".to_vec())
            .with_message_id(12_u64)
            .with_creation_time(now)
            .with_content_type("text/plain")
            .with_application_property("region", "emea")
            .with_message_annotation("x-routing-key", "emea");

        assert_eq!(record.body(), b"first wave");
        assert_eq!(record.message_id(), Some(&MessageId::Number(12)));
        assert_eq!(record.creation_time(), Some(now));
        assert_eq!(record.content_type(), Some("text/plain"));
        assert_eq!(
            record.application_property("region"),
            Some(&Value::from("emea"))
        );
        assert_eq!(
            record.message_annotation("x-routing-key"),
            Some(&Value::from("emea"))
        );
        assert_eq!(record.publishing_id(), None);
    }

    #[test]
    fn should_return_none_for_non_utf8_body() {
        let record = Record::new(vec![0xff, 0xfe]);
        assert_eq!(record.body_str(), None);
        assert_eq!(record.len(), 2);
        assert!(!record.is_empty());
    }

    #[test]
    fn should_omit_empty_metadata_when_serialized() {
        let record = Record::new("hello world");
        let json = serde_json::to_value(&record).unwrap();

        assert!(json.get("application_properties").is_none());
        assert!(json.get("publishing_id").is_none());
        let properties = json.get("properties").unwrap();
        assert!(properties.get("message_id").is_none());
    }

    #[test]
    fn should_accept_numeric_and_text_message_ids() {
        let numeric: MessageId = serde_json::from_str("7").unwrap();
        let text: MessageId = serde_json::from_str("\"order-7\"").unwrap();

        assert_eq!(numeric, MessageId::Number(7));
        assert_eq!(text, MessageId::from("order-7"));
        assert_eq!(text.to_string(), "order-7");
    }
}
