//! Event message envelope
//!
//! The broker-agnostic wire format shared by every adapter. Uses snake_case
//! JSON keys: `id, event_name, payload, module_name, metadata, retry_count,
//! timestamp`.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Durable envelope carried through queues
///
/// `id` and `event_name` never change for the lifetime of a message. A retry
/// produces a new envelope via [`EventMessage::with_retry`] with the retry
/// count bumped by exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default = "generate_message_id")]
    id: String,

    #[serde(default)]
    event_name: String,

    #[serde(default)]
    payload: serde_json::Value,

    #[serde(default)]
    module_name: Option<String>,

    #[serde(default, deserialize_with = "lenient_metadata")]
    metadata: HashMap<String, serde_json::Value>,

    #[serde(default)]
    retry_count: u32,

    #[serde(default = "now_secs")]
    timestamp: i64,
}

impl EventMessage {
    /// Create a new message with a generated id and the current timestamp
    pub fn new(event_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_name: event_name.into(),
            payload,
            module_name: None,
            metadata: HashMap::new(),
            retry_count: 0,
            timestamp: now_secs(),
        }
    }

    /// Override the producer-generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the target module routing hint
    pub fn with_module(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = Some(module_name.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merge a metadata map, overwriting existing keys
    pub fn with_metadata_map(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Set the producer-side unix timestamp (seconds)
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the retry count (used when rebuilding envelopes from native fields)
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Copy of this message with `retry_count + 1`; everything else unchanged
    pub fn with_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn module_name(&self) -> Option<&str> {
        self.module_name.as_deref()
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Serialize to the JSON wire format
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to JSON bytes
    pub fn to_vec(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the JSON wire format
    ///
    /// Missing `id` gets a fresh `msg-<uuid>` token and missing `timestamp`
    /// the current time, so partial or legacy payloads are accepted.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse JSON bytes
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn generate_message_id() -> String {
    format!("msg-{}", uuid::Uuid::new_v4())
}

/// Current unix time in seconds
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Accepts an object, `null`, or an empty array (older producers encoded an
/// empty map as `[]`).
fn lenient_metadata<'de, D>(deserializer: D) -> Result<HashMap<String, serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(HashMap::new()),
        serde_json::Value::Array(items) if items.is_empty() => Ok(HashMap::new()),
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(D::Error::custom(format!(
            "metadata must be an object, got {}",
            other
        ))),
    }
}
