//! Async event bus: durable publish, module routing, retry and dead-lettering
//!
//! `AsyncEventBus` sits on top of one [`QueueAdapter`]. Publishing builds an
//! [`EventMessage`] and hands it to the module queue (or the default queue).
//! Consuming wraps the caller's handler so that every delivery ends in one of:
//!
//! - **Acked**: the handler succeeded
//! - **Retried**: a copy with `retry_count + 1` is parked on
//!   `<queue>.retry.<delay>`, a TTL queue that dead-letters back to `<queue>`
//!   through the main exchange once the delay has passed
//! - **Dead-lettered**: retries are exhausted; the copy goes to the DLQ with
//!   `error`, `error_class` and `failed_at` metadata
//!
//! The original delivery is acknowledged only after the retry or dead-letter
//! copy was accepted. If that publish fails the delivery is left to the
//! adapter, which requeues it.

use crate::adapter::{handler_fn, HandlerError, HandlerResult, MessageHandler, QueueAdapter};
use crate::dlq::DeadLetter;
use crate::error::{QueueError, Result};
use crate::listener::{EventBus, Listener, ListenerId};
use crate::message::EventMessage;
use crate::retry::RetryPolicy;
use crate::types::{ConsumeOptions, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Routing key the dead-letter queue is bound with
pub const DLQ_ROUTING_KEY: &str = "dlq";

/// Bus-level naming and default retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Topic exchange every bus queue is bound to
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Terminal queue for messages that exhausted their retries
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,

    /// Destination for messages without a registered module queue
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Policy used when neither the consumer nor the per-event table sets one
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            dead_letter_queue: default_dead_letter_queue(),
            default_queue: default_queue(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

fn default_exchange() -> String {
    "a3s.events".to_string()
}

fn default_dead_letter_queue() -> String {
    "a3s.events.dlq".to_string()
}

fn default_queue() -> String {
    "a3s.events.default".to_string()
}

/// Options for [`AsyncEventBus::publish_async`]
#[derive(Debug, Clone, Default)]
pub struct AsyncPublishOptions {
    /// Target module; routes to its registered queue when there is one
    pub module: Option<String>,

    /// Extra metadata stored on the envelope
    pub metadata: HashMap<String, Value>,

    /// Passed through to the adapter
    pub publish: PublishOptions,
}

impl AsyncPublishOptions {
    pub fn for_module(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Name of the delay queue holding retries of `queue` for `delay_secs`
///
/// Delay queues are per source queue (`<queue>.retry.<delay>`) instead of a
/// shared `retry.<delay>` keyed by event name: on expiry the copy is
/// dead-lettered with the source queue as routing key, and every bus queue is
/// bound under its own name, so the retry lands back where it failed.
pub fn retry_queue_name(queue: &str, delay_secs: u64) -> String {
    format!("{}.retry.{}", queue, delay_secs)
}

/// Routing pattern a module queue is bound with
pub fn module_routing_pattern(module: &str) -> String {
    format!("module.{}.*", module)
}

/// Durable event bus over a queue adapter, with an in-process listener registry
pub struct AsyncEventBus {
    adapter: Arc<dyn QueueAdapter>,
    config: BusConfig,
    listeners: EventBus,
    module_queues: RwLock<HashMap<String, String>>,
    retry_policies: PolicyTable,
}

/// Per-event retry policies, shared with running consumers
type PolicyTable = Arc<RwLock<HashMap<String, RetryPolicy>>>;

impl std::fmt::Debug for AsyncEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEventBus")
            .field("adapter", &self.adapter.name())
            .field("config", &self.config)
            .finish()
    }
}

impl AsyncEventBus {
    /// Declare the exchange, the DLQ and the default queue, then return the bus
    pub async fn new(adapter: Arc<dyn QueueAdapter>, config: BusConfig) -> Result<Self> {
        adapter
            .declare_exchange(&config.exchange, ExchangeKind::Topic, &ExchangeOptions::default())
            .await?;

        adapter
            .declare_queue(&config.dead_letter_queue, &QueueOptions::default())
            .await?;
        adapter
            .bind_queue(&config.dead_letter_queue, &config.exchange, DLQ_ROUTING_KEY)
            .await?;

        adapter
            .declare_queue(
                &config.default_queue,
                &QueueOptions::with_dead_letter(&config.exchange, DLQ_ROUTING_KEY),
            )
            .await?;
        adapter
            .bind_queue(&config.default_queue, &config.exchange, &config.default_queue)
            .await?;

        tracing::info!(
            adapter = adapter.name(),
            exchange = %config.exchange,
            dlq = %config.dead_letter_queue,
            "Async event bus initialized"
        );

        Ok(Self {
            adapter,
            config,
            listeners: EventBus::new(),
            module_queues: RwLock::new(HashMap::new()),
            retry_policies: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Bus with the default configuration
    pub async fn with_defaults(adapter: Arc<dyn QueueAdapter>) -> Result<Self> {
        Self::new(adapter, BusConfig::default()).await
    }

    pub fn adapter(&self) -> &Arc<dyn QueueAdapter> {
        &self.adapter
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ---- In-process listeners ----

    /// Register an in-process listener
    pub fn subscribe<F>(&self, event_name: &str, priority: i32, callback: F) -> ListenerId
    where
        F: Fn(&Value, &str) -> HandlerResult + Send + Sync + 'static,
    {
        self.listeners.subscribe(event_name, priority, callback)
    }

    pub fn unsubscribe(&self, event_name: &str, id: ListenerId) -> bool {
        self.listeners.unsubscribe(event_name, id)
    }

    pub fn has_listeners(&self, event_name: &str) -> bool {
        self.listeners.has_listeners(event_name)
    }

    pub fn listeners(&self, event_name: &str) -> Vec<Listener> {
        self.listeners.listeners(event_name)
    }

    /// Run in-process listeners now; never touches the adapter
    pub fn publish(&self, event_name: &str, payload: &Value) -> HandlerResult {
        self.listeners.publish(event_name, payload)
    }

    // ---- Durable publish ----

    /// Publish through the adapter; never runs in-process listeners
    ///
    /// Adapter errors (e.g. the broker is unreachable) are returned to the caller.
    pub async fn publish_async(
        &self,
        event_name: &str,
        payload: Value,
        options: AsyncPublishOptions,
    ) -> Result<Option<String>> {
        let queue = self.resolve_queue(options.module.as_deref());

        let mut message = EventMessage::new(event_name, payload).with_metadata_map(options.metadata);
        if let Some(module) = options.module {
            message = message.with_module(module);
        }

        let id = self.adapter.publish(&queue, &message, &options.publish).await?;

        tracing::debug!(
            message_id = %message.id(),
            event_name,
            queue = %queue,
            accepted = id.is_some(),
            "Event published"
        );

        Ok(id)
    }

    /// Publish to a module's queue
    pub async fn publish_to_module(
        &self,
        module: &str,
        event_name: &str,
        payload: Value,
        options: AsyncPublishOptions,
    ) -> Result<Option<String>> {
        let options = AsyncPublishOptions {
            module: Some(module.to_string()),
            ..options
        };
        self.publish_async(event_name, payload, options).await
    }

    /// Declare a durable queue for `module` and route the module's traffic to it
    pub async fn register_module_queue(&self, module: &str, queue: &str) -> Result<()> {
        self.adapter
            .declare_queue(
                queue,
                &QueueOptions::with_dead_letter(&self.config.exchange, DLQ_ROUTING_KEY),
            )
            .await?;
        self.adapter
            .bind_queue(queue, &self.config.exchange, &module_routing_pattern(module))
            .await?;
        self.adapter
            .bind_queue(queue, &self.config.exchange, queue)
            .await?;

        self.module_queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.to_string(), queue.to_string());

        tracing::info!(module, queue, "Module queue registered");
        Ok(())
    }

    /// Queue registered for `module`
    pub fn module_queue(&self, module: &str) -> Option<String> {
        self.module_queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
    }

    fn resolve_queue(&self, module: Option<&str>) -> String {
        module
            .and_then(|m| self.module_queue(m))
            .unwrap_or_else(|| self.config.default_queue.clone())
    }

    // ---- Retry policies ----

    /// Set the retry policy for one event name
    pub fn set_retry_policy(&self, event_name: &str, policy: RetryPolicy) {
        self.retry_policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_name.to_string(), policy);
    }

    /// Policy applied to `event_name` when the consumer doesn't override it
    pub fn retry_policy(&self, event_name: &str) -> RetryPolicy {
        self.retry_policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
            .unwrap_or_else(|| self.config.retry_policy.clone())
    }

    // ---- Consume ----

    /// Consume `options.queue` (default queue if unset) until `shutdown` is cancelled
    ///
    /// Handler failures drive retry/dead-lettering and never surface here;
    /// only adapter errors do.
    pub async fn consume(
        &self,
        handler: MessageHandler,
        options: ConsumeOptions,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| self.config.default_queue.clone());

        // Retries dead-letter back by queue name
        self.adapter
            .bind_queue(&queue, &self.config.exchange, &queue)
            .await?;

        let router = Arc::new(RetryRouter {
            adapter: Arc::clone(&self.adapter),
            exchange: self.config.exchange.clone(),
            dead_letter_queue: self.config.dead_letter_queue.clone(),
            queue: queue.clone(),
            override_policy: options.retry_policy.clone(),
            event_policies: Arc::clone(&self.retry_policies),
            default_policy: self.config.retry_policy.clone(),
        });

        let wrapped = handler_fn(move |message| {
            let router = Arc::clone(&router);
            let handler = Arc::clone(&handler);
            async move { router.handle(&handler, message).await }
        });

        tracing::info!(queue = %queue, group = %options.consumer_group, "Consuming");
        self.adapter.consume(&queue, wrapped, &options, shutdown).await
    }

    /// Acknowledge a delivery through the adapter
    pub async fn acknowledge(&self, message_id: &str) -> Result<()> {
        self.adapter.acknowledge(message_id).await
    }

    /// Reject a delivery through the adapter
    pub async fn reject(&self, message_id: &str, requeue: bool) -> Result<()> {
        self.adapter.reject(message_id, requeue).await
    }
}

/// Per-consume state behind the wrapped handler
struct RetryRouter {
    adapter: Arc<dyn QueueAdapter>,
    exchange: String,
    dead_letter_queue: String,
    queue: String,
    override_policy: Option<RetryPolicy>,
    event_policies: PolicyTable,
    default_policy: RetryPolicy,
}

impl RetryRouter {
    /// Read at escalation time so `set_retry_policy` reaches running consumers
    fn policy_for(&self, event_name: &str) -> RetryPolicy {
        if let Some(policy) = &self.override_policy {
            return policy.clone();
        }
        self.event_policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    async fn handle(&self, handler: &MessageHandler, message: EventMessage) -> HandlerResult {
        let message_id = message.id().to_string();

        match handler(message.clone()).await {
            Ok(()) => {
                tracing::debug!(message_id = %message_id, queue = %self.queue, "Message handled");
            }
            Err(error) => {
                tracing::warn!(
                    message_id = %message_id,
                    event_name = %message.event_name(),
                    retry_count = message.retry_count(),
                    error = %error,
                    "Handler failed"
                );
                if let Err(e) = self.escalate(&message, &error).await {
                    tracing::error!(
                        message_id = %message_id,
                        queue = %self.queue,
                        error = %e,
                        "Retry/dead-letter publish failed, leaving delivery to the adapter"
                    );
                    return Err(HandlerError::from_error(e));
                }
            }
        }

        self.adapter
            .acknowledge(&message_id)
            .await
            .map_err(HandlerError::from_error)
    }

    /// Park a retry copy or dead-letter the message
    async fn escalate(&self, message: &EventMessage, error: &HandlerError) -> Result<()> {
        let policy = self.policy_for(message.event_name());

        if policy.should_retry(message.retry_count()) {
            let delay_secs = policy.delay_for(message.retry_count());
            let retry_queue = retry_queue_name(&self.queue, delay_secs);
            let options = QueueOptions::with_dead_letter(&self.exchange, &self.queue)
                .ttl_ms(delay_secs.saturating_mul(1_000));

            self.adapter.declare_queue(&retry_queue, &options).await?;

            let retry = message.with_retry();
            self.publish_required(&retry_queue, &retry).await?;

            tracing::info!(
                message_id = %message.id(),
                retry_count = retry.retry_count(),
                delay_secs,
                queue = %retry_queue,
                "Message scheduled for retry"
            );
        } else {
            let dead = DeadLetter::new(message.clone(), error).into_message();
            self.publish_required(&self.dead_letter_queue, &dead).await?;

            tracing::warn!(
                message_id = %message.id(),
                event_name = %message.event_name(),
                retry_count = message.retry_count(),
                dlq = %self.dead_letter_queue,
                "Message dead-lettered"
            );
        }
        Ok(())
    }

    async fn publish_required(&self, queue: &str, message: &EventMessage) -> Result<()> {
        match self
            .adapter
            .publish(queue, message, &PublishOptions::default())
            .await?
        {
            Some(_) => Ok(()),
            None => Err(QueueError::Publish {
                queue: queue.to_string(),
                reason: "message refused by adapter".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use serde_json::json;

    async fn bus() -> (MemoryAdapter, AsyncEventBus) {
        let adapter = MemoryAdapter::new();
        let bus = AsyncEventBus::with_defaults(Arc::new(adapter.clone())).await.unwrap();
        (adapter, bus)
    }

    fn router(adapter: &MemoryAdapter, policy: Option<RetryPolicy>) -> RetryRouter {
        RetryRouter {
            adapter: Arc::new(adapter.clone()),
            exchange: "a3s.events".to_string(),
            dead_letter_queue: "a3s.events.dlq".to_string(),
            queue: "orders".to_string(),
            override_policy: policy,
            event_policies: Arc::default(),
            default_policy: RetryPolicy::default(),
        }
    }

    fn failing() -> MessageHandler {
        handler_fn(|_msg| async { Err(HandlerError::new("Timeout", "downstream timed out")) })
    }

    #[test]
    fn test_bus_config_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.exchange, "a3s.events");
        assert_eq!(config.dead_letter_queue, "a3s.events.dlq");
        assert_eq!(config.default_queue, "a3s.events.default");
        assert_eq!(config.retry_policy, RetryPolicy::default());

        let parsed: BusConfig = serde_json::from_str(r#"{"exchange": "shop"}"#).unwrap();
        assert_eq!(parsed.exchange, "shop");
        assert_eq!(parsed.default_queue, "a3s.events.default");
    }

    #[test]
    fn test_naming() {
        assert_eq!(retry_queue_name("orders", 4), "orders.retry.4");
        assert_eq!(module_routing_pattern("billing"), "module.billing.*");
    }

    #[tokio::test]
    async fn test_new_declares_topology() {
        let (adapter, _bus) = bus().await;

        assert_eq!(
            adapter.declared_exchanges()["a3s.events"].0,
            ExchangeKind::Topic
        );
        let queues = adapter.declared_queues();
        assert!(queues.contains_key("a3s.events.dlq"));
        assert_eq!(
            queues["a3s.events.default"].dead_letter.as_ref().unwrap().routing_key,
            DLQ_ROUTING_KEY
        );
        assert!(adapter.bindings().iter().any(|b| b.queue == "a3s.events.dlq" && b.routing_key == "dlq"));
    }

    #[tokio::test]
    async fn test_publish_async_defaults_to_default_queue() {
        let (adapter, bus) = bus().await;

        let id = bus
            .publish_async("order.created", json!({"id": 42}), AsyncPublishOptions::default())
            .await
            .unwrap()
            .unwrap();

        let published = adapter.messages_for_queue("a3s.events.default");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id(), id);
        assert_eq!(published[0].retry_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_module_falls_back_to_default() {
        let (adapter, bus) = bus().await;

        bus.publish_to_module("shipping", "parcel.sent", json!({}), AsyncPublishOptions::default())
            .await
            .unwrap();

        let published = adapter.messages_for_queue("a3s.events.default");
        assert_eq!(published[0].module_name(), Some("shipping"));
    }

    #[tokio::test]
    async fn test_publish_async_carries_metadata() {
        let (adapter, bus) = bus().await;

        bus.publish_async(
            "user.created",
            json!({}),
            AsyncPublishOptions::default().with_metadata("trace_id", "t-9"),
        )
        .await
        .unwrap();

        assert_eq!(adapter.published()[0].message.metadata()["trace_id"], "t-9");
    }

    #[tokio::test]
    async fn test_publish_async_skips_listeners() {
        let (_adapter, bus) = bus().await;
        bus.subscribe("user.created", 0, |_, _| Err(HandlerError::msg("must not run")));

        assert!(bus
            .publish_async("user.created", json!({}), AsyncPublishOptions::default())
            .await
            .is_ok());
        assert!(bus.publish("user.created", &json!({})).is_err());
    }

    #[tokio::test]
    async fn test_register_module_queue_binds_pattern() {
        let (adapter, bus) = bus().await;
        bus.register_module_queue("billing", "billing.events").await.unwrap();

        assert_eq!(bus.module_queue("billing").as_deref(), Some("billing.events"));
        let bindings = adapter.bindings();
        assert!(bindings
            .iter()
            .any(|b| b.queue == "billing.events" && b.routing_key == "module.billing.*"));
        assert!(bindings
            .iter()
            .any(|b| b.queue == "billing.events" && b.routing_key == "billing.events"));
    }

    #[test]
    fn test_policy_resolution_order() {
        let adapter = MemoryAdapter::new();
        let mut r = router(&adapter, None);
        r.event_policies
            .write()
            .unwrap()
            .insert("order.created".to_string(), RetryPolicy::aggressive());

        assert_eq!(r.policy_for("order.created").max_retries, 10);
        assert_eq!(r.policy_for("user.created").max_retries, 3);

        r.override_policy = Some(RetryPolicy::no_retry());
        assert_eq!(r.policy_for("order.created").max_retries, 0);
    }

    #[tokio::test]
    async fn test_policy_change_reaches_running_consumer() {
        let (adapter, bus) = bus().await;
        let bus = Arc::new(bus);
        let dlq = bus.config().dead_letter_queue.clone();

        let shutdown = CancellationToken::new();
        let consumer = {
            let bus = Arc::clone(&bus);
            let shutdown = shutdown.clone();
            let handler = handler_fn(|message| async move {
                if message.event_name() == "warmup" {
                    Ok(())
                } else {
                    Err(HandlerError::msg("boom"))
                }
            });
            tokio::spawn(async move { bus.consume(handler, ConsumeOptions::default(), shutdown).await })
        };

        let warmup = bus
            .publish_async("warmup", json!({}), AsyncPublishOptions::default())
            .await
            .unwrap()
            .unwrap();
        for _ in 0..200 {
            if adapter.acknowledged().contains(&warmup) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(adapter.acknowledged().contains(&warmup));

        bus.set_retry_policy("order.created", RetryPolicy::no_retry());
        bus.publish_async("order.created", json!({"id": 1}), AsyncPublishOptions::default())
            .await
            .unwrap();
        for _ in 0..200 {
            if !adapter.queued(&dlq).is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        shutdown.cancel();
        consumer.await.unwrap().unwrap();

        assert_eq!(adapter.queued(&dlq).len(), 1);
        assert!(adapter.declared_queues().keys().all(|q| !q.contains(".retry.")));
    }

    #[tokio::test]
    async fn test_bus_retry_policy_table() {
        let (_adapter, bus) = bus().await;
        bus.set_retry_policy("payment.failed", RetryPolicy::no_retry());

        assert_eq!(bus.retry_policy("payment.failed").max_retries, 0);
        assert_eq!(bus.retry_policy("other"), RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_failure_parks_retry_copy() {
        let adapter = MemoryAdapter::new();
        let r = router(&adapter, None);
        let message = EventMessage::new("order.created", json!({"id": 1}));

        r.handle(&failing(), message.clone()).await.unwrap();

        let declared = adapter.declared_queues();
        let retry_options = &declared["orders.retry.1"];
        assert_eq!(retry_options.message_ttl_ms, Some(1_000));
        let target = retry_options.dead_letter.as_ref().unwrap();
        assert_eq!(target.exchange, "a3s.events");
        assert_eq!(target.routing_key, "orders");

        let parked = adapter.messages_for_queue("orders.retry.1");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id(), message.id());
        assert_eq!(parked[0].retry_count(), 1);
    }

    #[tokio::test]
    async fn test_backoff_selects_retry_queue() {
        let adapter = MemoryAdapter::new();
        let r = router(&adapter, None);
        let message = EventMessage::new("order.created", json!({}))
            .with_retry()
            .with_retry();

        r.handle(&failing(), message).await.unwrap();

        assert_eq!(adapter.messages_for_queue("orders.retry.4").len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dead_lettered() {
        let adapter = MemoryAdapter::new();
        let r = router(&adapter, Some(RetryPolicy::no_retry()));
        let message = EventMessage::new("order.created", json!({"id": 42}));

        r.handle(&failing(), message.clone()).await.unwrap();

        let dead = adapter.messages_for_queue("a3s.events.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id(), message.id());
        assert_eq!(dead[0].retry_count(), 0);
        assert_eq!(dead[0].metadata()["error"], "downstream timed out");
        assert_eq!(dead[0].metadata()["error_class"], "Timeout");
        assert!(dead[0].metadata()["failed_at"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_escalation_failure_is_returned_to_adapter() {
        let adapter = MemoryAdapter::new();
        let r = router(&adapter, None);
        adapter.close().await.unwrap();

        let result = r
            .handle(&failing(), EventMessage::new("order.created", json!({})))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_success_acknowledges_delivery() {
        let adapter = MemoryAdapter::new();
        let message = EventMessage::new("order.created", json!({}));
        adapter
            .publish("orders", &message, &PublishOptions::default())
            .await
            .unwrap();
        adapter.fetch("orders").await.unwrap();

        let r = router(&adapter, None);
        r.handle(&handler_fn(|_msg| async { Ok(()) }), message.clone())
            .await
            .unwrap();

        assert_eq!(adapter.acknowledged(), vec![message.id().to_string()]);
        assert!(adapter.unacknowledged().await.is_empty());
    }
}
