//! In-memory queue adapter for testing and single-process use
//!
//! Models a small topic-exchange broker: named FIFO queues, exchanges with
//! bindings, TTL + dead-letter delay queues and requeue on reject. Every call
//! is recorded so tests can assert on what was published, acknowledged,
//! rejected, declared and bound.

use super::{topic_matches, DeliveryTracker, MessageHandler, QueueAdapter};
use crate::error::{QueueError, Result};
use crate::message::EventMessage;
use crate::types::{ConsumeOptions, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A publish call as seen by the adapter
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub queue: String,
    pub message: EventMessage,
    pub options: PublishOptions,
}

/// A reject call that resolved a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedMessage {
    pub message_id: String,
    pub requeue: bool,
}

/// A queue → exchange binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Delivery handle: where the message came from and what to put back
#[derive(Debug, Clone)]
struct MemoryHandle {
    queue: String,
    sequence: u64,
    message: EventMessage,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<EventMessage>>,
    declared_queues: HashMap<String, QueueOptions>,
    declared_exchanges: HashMap<String, (ExchangeKind, ExchangeOptions)>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    acknowledged: Vec<String>,
    rejected: Vec<RejectedMessage>,
}

struct Inner {
    state: Mutex<State>,
    tracker: DeliveryTracker<MemoryHandle>,
    notify: Notify,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Put a message on a named queue, or hold it first if it is a delay queue
    fn enqueue(self: &Arc<Self>, queue: &str, message: EventMessage) {
        let delay = {
            let state = self.state();
            state
                .declared_queues
                .get(queue)
                .filter(|opts| opts.is_delay_queue())
                .and_then(|opts| Some((opts.message_ttl_ms?, opts.dead_letter.clone()?)))
        };

        match delay {
            Some((ttl_ms, target)) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
                    tracing::debug!(
                        message_id = %message.id(),
                        exchange = %target.exchange,
                        routing_key = %target.routing_key,
                        "Delayed message expired, dead-lettering"
                    );
                    inner.route(&target.exchange, &target.routing_key, message);
                });
            }
            None => {
                self.state()
                    .queues
                    .entry(queue.to_string())
                    .or_default()
                    .push_back(message);
                self.notify.notify_waiters();
            }
        }
    }

    /// Route through an exchange; the default exchange ("") addresses queues directly
    fn route(self: &Arc<Self>, exchange: &str, routing_key: &str, message: EventMessage) {
        if exchange.is_empty() {
            self.enqueue(routing_key, message);
            return;
        }

        let targets: Vec<String> = {
            let state = self.state();
            let kind = state
                .declared_exchanges
                .get(exchange)
                .map(|(kind, _)| *kind)
                .unwrap_or_default();

            let mut seen = HashSet::new();
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| match kind {
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Fanout | ExchangeKind::Headers => true,
                })
                .filter(|b| seen.insert(b.queue.as_str()))
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            tracing::debug!(
                exchange,
                routing_key,
                message_id = %message.id(),
                "Unroutable message dropped"
            );
            return;
        }

        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
    }

    fn pop(&self, queue: &str) -> Option<EventMessage> {
        self.state().queues.get_mut(queue)?.pop_front()
    }
}

/// In-memory queue adapter
///
/// Cheap to clone; clones share the same broker state.
#[derive(Clone)]
pub struct MemoryAdapter {
    inner: Arc<Inner>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                tracker: DeliveryTracker::new(),
                notify: Notify::new(),
                sequence: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("memory adapter closed".to_string()));
        }
        Ok(())
    }

    /// Take the next message off `queue` and record it as delivered
    ///
    /// The pull-mode counterpart of `consume`: the caller must resolve the
    /// delivery with `acknowledge` or `reject`.
    pub async fn fetch(&self, queue: &str) -> Option<EventMessage> {
        let message = self.inner.pop(queue)?;
        let handle = MemoryHandle {
            queue: queue.to_string(),
            sequence: self.inner.sequence.fetch_add(1, Ordering::SeqCst),
            message: message.clone(),
        };
        self.inner.tracker.record(message.id(), handle).await;
        Some(message)
    }

    /// Every publish call, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state().published.clone()
    }

    /// Messages published to a specific queue, in order
    pub fn messages_for_queue(&self, queue: &str) -> Vec<EventMessage> {
        self.inner
            .state()
            .published
            .iter()
            .filter(|p| p.queue == queue)
            .map(|p| p.message.clone())
            .collect()
    }

    /// Messages currently waiting on a queue
    pub fn queued(&self, queue: &str) -> Vec<EventMessage> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids that were acknowledged, in order
    pub fn acknowledged(&self) -> Vec<String> {
        self.inner.state().acknowledged.clone()
    }

    /// Rejections that resolved a delivery, in order
    pub fn rejected(&self) -> Vec<RejectedMessage> {
        self.inner.state().rejected.clone()
    }

    /// Ids delivered but not yet acknowledged or rejected
    pub async fn unacknowledged(&self) -> Vec<String> {
        self.inner.tracker.pending_ids().await
    }

    pub fn declared_queues(&self) -> HashMap<String, QueueOptions> {
        self.inner.state().declared_queues.clone()
    }

    pub fn declared_exchanges(&self) -> HashMap<String, (ExchangeKind, ExchangeOptions)> {
        self.inner.state().declared_exchanges.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.inner.state().bindings.clone()
    }

    /// Forget all recorded calls and queued messages
    pub async fn clear(&self) {
        *self.inner.state() = State::default();
        self.inner.tracker.clear().await;
    }
}

#[async_trait]
impl QueueAdapter for MemoryAdapter {
    async fn publish(
        &self,
        queue: &str,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> Result<Option<String>> {
        self.ensure_open()?;

        if let Some(ref queue_options) = options.queue_options {
            self.declare_queue(queue, queue_options).await?;
        }

        self.inner.state().published.push(PublishedMessage {
            queue: queue.to_string(),
            message: message.clone(),
            options: options.clone(),
        });

        let exchange = options.exchange.as_deref().unwrap_or("");
        let routing_key = options.routing_key.as_deref().unwrap_or(queue);
        self.inner.route(exchange, routing_key, message.clone());

        tracing::debug!(
            message_id = %message.id(),
            queue,
            event_name = %message.event_name(),
            "Message published"
        );

        Ok(Some(message.id().to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        options: &ConsumeOptions,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        let idle = Duration::from_millis(options.block_timeout_ms.max(1));

        tracing::info!(queue, "Memory consumer started");

        while !shutdown.is_cancelled() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.fetch(queue).await {
                let message_id = message.id().to_string();
                match handler(message).await {
                    Ok(()) => self.acknowledge(&message_id).await?,
                    Err(e) => {
                        tracing::warn!(message_id = %message_id, queue, error = %e, "Handler failed, requeueing");
                        self.reject(&message_id, true).await?;
                    }
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut notified => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }

        tracing::info!(queue, "Memory consumer stopped");
        Ok(())
    }

    async fn acknowledge(&self, message_id: &str) -> Result<()> {
        if self.inner.tracker.take(message_id).await.is_some() {
            self.inner.state().acknowledged.push(message_id.to_string());
        }
        Ok(())
    }

    async fn reject(&self, message_id: &str, requeue: bool) -> Result<()> {
        let Some(handle) = self.inner.tracker.take(message_id).await else {
            return Ok(());
        };

        let dead_letter = {
            let mut state = self.inner.state();
            state.rejected.push(RejectedMessage {
                message_id: message_id.to_string(),
                requeue,
            });
            state
                .declared_queues
                .get(&handle.queue)
                .and_then(|opts| opts.dead_letter.clone())
        };

        tracing::debug!(message_id, queue = %handle.queue, sequence = handle.sequence, requeue, "Delivery rejected");

        if requeue {
            self.inner.enqueue(&handle.queue, handle.message);
        } else if let Some(target) = dead_letter {
            self.inner.route(&target.exchange, &target.routing_key, handle.message);
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        match state.declared_queues.get(queue) {
            Some(existing) if existing != options => {
                tracing::warn!(queue, "Queue already declared with different options, keeping original");
            }
            Some(_) => {}
            None => {
                state.declared_queues.insert(queue.to_string(), options.clone());
                state.queues.entry(queue.to_string()).or_default();
            }
        }
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .state()
            .declared_exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| (kind, options.clone()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        let mut state = self.inner.state();
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
