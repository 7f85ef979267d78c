//! Dead letters: messages that exhausted their retries
//!
//! A dead letter is the original envelope with three metadata fields added:
//! `error`, `error_class` and `failed_at` (unix seconds). Id, event name,
//! payload, module and retry count are carried over untouched so the message
//! can be inspected or replayed with adapter-native tooling.

use crate::adapter::HandlerError;
use crate::message::{now_secs, EventMessage};
use serde_json::Value;

/// Metadata key holding the failure message
pub const ERROR_KEY: &str = "error";

/// Metadata key holding the failure type
pub const ERROR_CLASS_KEY: &str = "error_class";

/// Metadata key holding the unix time the message was dead-lettered
pub const FAILED_AT_KEY: &str = "failed_at";

/// A failed message with context about why it ended up in the DLQ
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// The message as it was last delivered
    pub message: EventMessage,

    /// Reason the handler gave
    pub error: String,

    /// Type of the failure
    pub error_class: String,

    /// Unix timestamp in seconds when the message was dead-lettered
    pub failed_at: i64,
}

impl DeadLetter {
    /// Dead letter for `message` failing with `error`, stamped now
    pub fn new(message: EventMessage, error: &HandlerError) -> Self {
        Self::at(message, error, now_secs())
    }

    /// Dead letter with an explicit failure time
    pub fn at(message: EventMessage, error: &HandlerError, failed_at: i64) -> Self {
        Self {
            message,
            error: error.message.clone(),
            error_class: error.class.clone(),
            failed_at,
        }
    }

    /// The envelope published to the dead-letter queue
    pub fn into_message(self) -> EventMessage {
        self.message
            .with_metadata(ERROR_KEY, self.error)
            .with_metadata(ERROR_CLASS_KEY, self.error_class)
            .with_metadata(FAILED_AT_KEY, self.failed_at)
    }

    /// Recover the failure context from a message read off the DLQ
    ///
    /// Returns `None` for messages that were never dead-lettered.
    pub fn from_message(message: &EventMessage) -> Option<Self> {
        let metadata = message.metadata();
        let error = metadata.get(ERROR_KEY)?.as_str()?.to_string();
        let error_class = metadata
            .get(ERROR_CLASS_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let failed_at = metadata
            .get(FAILED_AT_KEY)
            .and_then(Value::as_i64)
            .unwrap_or_default();

        Some(Self {
            message: message.clone(),
            error,
            error_class,
            failed_at,
        })
    }
}
