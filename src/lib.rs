//! # a3s-queue
//!
//! Durable async event messaging with retry, backoff and dead-lettering for
//! the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-queue` provides a broker-agnostic API for publishing and consuming
//! events. Swap backends (AMQP, Redis streams, in-memory) without changing
//! application code; retry and dead-letter handling work the same on all of
//! them.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_queue::{handler_fn, AsyncEventBus, AsyncPublishOptions, ConsumeOptions};
//! use a3s_queue::adapter::memory::MemoryAdapter;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> a3s_queue::Result<()> {
//! let bus = AsyncEventBus::with_defaults(Arc::new(MemoryAdapter::new())).await?;
//!
//! // Durable publish
//! bus.publish_async(
//!     "order.created",
//!     serde_json::json!({"id": 42}),
//!     AsyncPublishOptions::default(),
//! ).await?;
//!
//! // Consume until cancelled; failures are retried with backoff, then dead-lettered
//! let shutdown = CancellationToken::new();
//! let handler = handler_fn(|message| async move {
//!     println!("{} {}", message.event_name(), message.payload());
//!     Ok(())
//! });
//! # shutdown.cancel();
//! bus.consume(handler, ConsumeOptions::default(), shutdown).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Adapters
//!
//! - **memory**: In-process broker model for testing and single-process use
//! - **amqp**: RabbitMQ-style topic exchange with TTL/dead-letter retry queues
//! - **redis_stream**: Redis streams with consumer groups and pending reclaim
//!
//! ## Architecture
//!
//! - **QueueAdapter** trait: core abstraction all backends implement
//! - **AsyncEventBus**: routing, retry escalation and dead-lettering
//! - **EventBus**: synchronous in-process listener registry
//! - **EventMessage**: broker-agnostic message envelope
//! - **RetryPolicy**: backoff configuration

pub mod adapter;
pub mod bus;
pub mod dlq;
pub mod error;
pub mod listener;
pub mod message;
pub mod retry;
pub mod types;

// Re-export core types
pub use adapter::{
    handler_fn, DeliveryTracker, HandlerError, HandlerResult, MessageHandler, QueueAdapter,
};
pub use bus::{AsyncEventBus, AsyncPublishOptions, BusConfig};
pub use dlq::DeadLetter;
pub use error::{QueueError, Result};
pub use listener::{EventBus, Listener, ListenerId};
pub use message::EventMessage;
pub use retry::RetryPolicy;
pub use types::{
    ConsumeOptions, DeadLetterTarget, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions,
};

// Re-export adapters for convenience
pub use adapter::amqp::{AmqpAdapter, AmqpConfig};
pub use adapter::memory::MemoryAdapter;
pub use adapter::redis_stream::{RedisStreamAdapter, RedisStreamConfig};
