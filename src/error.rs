//! Error types for a3s-queue

use thiserror::Error;

/// Errors that can occur in the queue layer
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backend unreachable (connection refused, auth failure, timeout)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish message to queue '{queue}': {reason}")]
    Publish {
        queue: String,
        reason: String,
    },

    /// Consume loop failure (not a handler failure)
    #[error("Failed to consume from queue '{queue}': {reason}")]
    Consume {
        queue: String,
        reason: String,
    },

    /// Queue, exchange or binding declaration failure
    #[error("Failed to declare '{name}': {reason}")]
    Declare {
        name: String,
        reason: String,
    },

    /// Acknowledgement or rejection failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend-specific error (AMQP channel, Redis command, etc.)
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            QueueError::Connection(e.to_string())
        } else {
            QueueError::Backend(e.to_string())
        }
    }
}

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                QueueError::Connection(e.to_string())
            }
            other => QueueError::Backend(other.to_string()),
        }
    }
}

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;
