//! Queue adapter trait: the contract every broker backend implements
//!
//! Backends differ in how they acknowledge and redeliver:
//!
//! | Backend | Ack handle | Redelivery trigger |
//! |---|---|---|
//! | `amqp` | channel delivery tag (invalid after reconnect) | `basic.nack` with requeue |
//! | `redis_stream` | stream entry id + group | pending entry reclaimed after the visibility timeout |
//! | `memory` | in-process sequence number | pushed back onto the queue |
//!
//! All three record `message id → handle` in a [`DeliveryTracker`] when a
//! message is delivered, and resolve it at most once.

use crate::error::Result;
use crate::message::EventMessage;
use crate::types::{ConsumeOptions, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub mod amqp;
pub mod memory;
pub mod redis_stream;

/// Failure reported by a message handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Error type name, recorded as `error_class` on dead letters
    pub class: String,
    /// Human-readable reason, recorded as `error`
    pub message: String,
}

impl HandlerError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Wrap any error, using its type name as the class
    pub fn from_error<E: std::error::Error>(error: E) -> Self {
        Self {
            class: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
        }
    }

    /// Plain failure with a generic class
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("HandlerError", message)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::from_error(e)
    }
}

/// Outcome of handling one message: `Ok` acknowledges, `Err` fails the delivery
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Async message handler invoked once per delivery
pub type MessageHandler = Arc<dyn Fn(EventMessage) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Build a [`MessageHandler`] from an async closure
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |message| -> BoxFuture<'static, HandlerResult> { Box::pin(f(message)) })
}

/// Core trait for queue backends
///
/// Declarations are idempotent. `acknowledge` and `reject` on an unknown or
/// already-resolved id return `Ok(())`.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Durably hand a message to the backend
    ///
    /// Returns the message id on acceptance, `None` if the adapter refused it
    /// (e.g. it could not be encoded or the broker nacked the publish).
    async fn publish(
        &self,
        queue: &str,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> Result<Option<String>>;

    /// Receive messages from `queue` until `shutdown` is cancelled
    ///
    /// Each message is recorded in the adapter's delivery bookkeeping before
    /// `handler` runs. If the handler did not resolve the delivery itself, it
    /// is acknowledged on `Ok` and rejected with requeue on `Err`.
    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        options: &ConsumeOptions,
        shutdown: CancellationToken,
    ) -> Result<()>;

    /// Acknowledge the last delivery of `message_id`
    async fn acknowledge(&self, message_id: &str) -> Result<()>;

    /// Reject the last delivery of `message_id`
    async fn reject(&self, message_id: &str, requeue: bool) -> Result<()>;

    /// Create a durable destination (idempotent)
    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<()>;

    /// Create an exchange (idempotent; no-op where exchanges don't exist)
    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()>;

    /// Route `exchange` messages matching `routing_key` into `queue`
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Adapter name (e.g., "amqp", "redis", "memory")
    fn name(&self) -> &str;

    /// Release connections; further calls fail
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// At-most-once acknowledgment bookkeeping: message id → native handle
///
/// A handle is recorded on every delivery, replacing any older handle for the
/// same id, and can be taken exactly once.
#[derive(Debug)]
pub struct DeliveryTracker<H> {
    handles: Mutex<HashMap<String, H>>,
}

impl<H: Clone + Send> DeliveryTracker<H> {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Record the handle of the latest delivery of `message_id`
    pub async fn record(&self, message_id: &str, handle: H) {
        self.handles.lock().await.insert(message_id.to_string(), handle);
    }

    /// Remove and return the handle; `None` if unknown or already resolved
    pub async fn take(&self, message_id: &str) -> Option<H> {
        self.handles.lock().await.remove(message_id)
    }

    pub async fn contains(&self, message_id: &str) -> bool {
        self.handles.lock().await.contains_key(message_id)
    }

    pub async fn get(&self, message_id: &str) -> Option<H> {
        self.handles.lock().await.get(message_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }

    /// Ids awaiting acknowledgment, sorted
    pub async fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop every handle (handles die with the connection that issued them)
    pub async fn clear(&self) {
        self.handles.lock().await.clear();
    }
}

impl<H: Clone + Send> Default for DeliveryTracker<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a dot-separated routing key matches a topic binding pattern
///
/// `*` matches exactly one segment, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_segments(rest, &key[skip..])),
        Some((&segment, rest)) => match key.split_first() {
            Some((&first, key_rest)) if segment == "*" || segment == first => {
                match_segments(rest, key_rest)
            }
            _ => false,
        },
    }
}
