//! Option types shared by every queue adapter
//!
//! Adapters ignore options that have no native counterpart (e.g. the stream
//! backend has no exchanges, the AMQP backend has no consumer groups).

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Exchange routing type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// Options for declaring an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Where a queue sends messages that expire or are rejected without requeue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterTarget {
    /// Exchange the message is re-published through
    pub exchange: String,

    /// Routing key used on the exchange
    ///
    /// Backends without exchanges resolve it against their recorded bindings
    /// and fall back to a queue of that name.
    pub routing_key: String,
}

/// Options for declaring a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,

    /// Delete when the last consumer goes away
    pub auto_delete: bool,

    /// Restrict to the declaring connection
    pub exclusive: bool,

    /// Per-message time-to-live in milliseconds (AMQP: `x-message-ttl`)
    ///
    /// Combined with `dead_letter`, turns the queue into a delay queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_ttl_ms: Option<u64>,

    /// Dead-letter routing (AMQP: `x-dead-letter-exchange` / `-routing-key`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetterTarget>,

    /// Approximate cap on stored messages (streams: `XTRIM MAXLEN ~`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
            message_ttl_ms: None,
            dead_letter: None,
            max_length: None,
        }
    }
}

impl QueueOptions {
    /// Durable queue that dead-letters through `exchange` with `routing_key`
    pub fn with_dead_letter(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            dead_letter: Some(DeadLetterTarget {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
            }),
            ..Default::default()
        }
    }

    /// Set the message TTL
    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }

    /// A queue whose messages are held for a TTL and then dead-lettered onward
    pub fn is_delay_queue(&self) -> bool {
        self.message_ttl_ms.is_some() && self.dead_letter.is_some()
    }
}

/// Options for publishing a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Exchange to publish through (default: direct-to-queue)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,

    /// Routing key override (default: the queue name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,

    /// Options used when the adapter declares the destination queue on publish
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_options: Option<QueueOptions>,
}

/// Options for a consume loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    /// Queue to consume from (bus-level; adapters receive it explicitly)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Consumer group (streams): cooperating consumers share deliveries
    pub consumer_group: String,

    /// Consumer name within the group (AMQP: consumer tag)
    ///
    /// Generated as `consumer-<uuid>` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_name: Option<String>,

    /// Messages fetched per read (AMQP: prefetch count)
    pub batch_size: usize,

    /// How long one blocking read waits, in milliseconds
    pub block_timeout_ms: u64,

    /// Idle time after which another consumer's pending entry may be reclaimed
    pub visibility_timeout_ms: u64,

    /// Retry policy override for this consumer (bus-level)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            queue: None,
            consumer_group: "default".to_string(),
            consumer_name: None,
            batch_size: 10,
            block_timeout_ms: 1_000,
            visibility_timeout_ms: 60_000,
            retry_policy: None,
        }
    }
}

impl ConsumeOptions {
    /// Consume from a specific queue
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Default::default()
        }
    }

    /// The configured consumer name, or a freshly generated one
    pub fn resolve_consumer_name(&self) -> String {
        self.consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4()))
    }
}
