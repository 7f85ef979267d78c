//! Contract checks every adapter must pass
//!
//! Each integration test file connects its backend and runs these against it.

#![allow(dead_code)]

use a3s_queue::{
    handler_fn, AsyncEventBus, AsyncPublishOptions, BusConfig, ConsumeOptions, DeadLetter,
    EventMessage, ExchangeKind, ExchangeOptions, HandlerError, MessageHandler, PublishOptions,
    QueueAdapter, QueueOptions, RetryPolicy,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound for one consume run against a live backend
pub const CONSUME_TIMEOUT: Duration = Duration::from_secs(20);

/// Unique name so concurrent test runs don't share queues
pub fn unique(prefix: &str) -> String {
    format!("{}.{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Short timeouts so redelivery and shutdown are quick
pub fn fast_options(queue: &str) -> ConsumeOptions {
    ConsumeOptions {
        queue: Some(queue.to_string()),
        block_timeout_ms: 100,
        visibility_timeout_ms: 200,
        ..Default::default()
    }
}

/// Records every delivery; fails the first `fail_first` and stops after `stop_after`
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<EventMessage>>>,
}

impl Recorder {
    pub fn handler(
        &self,
        fail_first: usize,
        stop_after: usize,
        shutdown: CancellationToken,
    ) -> MessageHandler {
        let seen = self.seen.clone();
        handler_fn(move |message| {
            let seen = seen.clone();
            let shutdown = shutdown.clone();
            async move {
                let attempt = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(message);
                    seen.len()
                };
                if attempt >= stop_after {
                    shutdown.cancel();
                }
                if attempt <= fail_first {
                    Err(HandlerError::new("TestFailure", format!("attempt {} fails", attempt)))
                } else {
                    Ok(())
                }
            }
        })
    }

    pub fn seen(&self) -> Vec<EventMessage> {
        self.seen.lock().unwrap().clone()
    }
}

async fn consume_raw(
    adapter: &Arc<dyn QueueAdapter>,
    queue: &str,
    recorder: &Recorder,
    fail_first: usize,
    stop_after: usize,
) {
    let shutdown = CancellationToken::new();
    let handler = recorder.handler(fail_first, stop_after, shutdown.clone());
    tokio::time::timeout(
        CONSUME_TIMEOUT,
        adapter.consume(queue, handler, &fast_options(queue), shutdown),
    )
    .await
    .expect("consumer timed out")
    .unwrap();
}

/// Published messages come back intact and in order
pub async fn publish_then_consume(adapter: Arc<dyn QueueAdapter>) {
    let queue = unique("contract.roundtrip");
    adapter.declare_queue(&queue, &QueueOptions::default()).await.unwrap();

    let mut sent = Vec::new();
    for i in 0..3 {
        let message = EventMessage::new("order.created", serde_json::json!({"n": i}))
            .with_module("orders")
            .with_metadata("trace_id", format!("t-{}", i));
        let id = adapter
            .publish(&queue, &message, &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some(message.id()));
        sent.push(message);
    }

    let recorder = Recorder::default();
    consume_raw(&adapter, &queue, &recorder, 0, 3).await;

    assert_eq!(recorder.seen(), sent);
}

/// A failed delivery is redelivered unchanged (adapter-level requeue does not bump retry_count)
pub async fn failed_delivery_is_redelivered(adapter: Arc<dyn QueueAdapter>) {
    let queue = unique("contract.redeliver");
    adapter.declare_queue(&queue, &QueueOptions::default()).await.unwrap();

    let message = EventMessage::new("order.created", serde_json::json!({"id": 7}));
    adapter
        .publish(&queue, &message, &PublishOptions::default())
        .await
        .unwrap();

    let recorder = Recorder::default();
    consume_raw(&adapter, &queue, &recorder, 1, 2).await;

    let seen = recorder.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|m| m.id() == message.id()));
    assert!(seen.iter().all(|m| m.retry_count() == 0));
}

/// Acknowledging or rejecting ids that were never delivered is a no-op
pub async fn unknown_ids_are_noops(adapter: Arc<dyn QueueAdapter>) {
    adapter.acknowledge("never-delivered").await.unwrap();
    adapter.reject("never-delivered", true).await.unwrap();
    adapter.reject("never-delivered", false).await.unwrap();
}

/// Declarations can be repeated
pub async fn declarations_are_idempotent(adapter: Arc<dyn QueueAdapter>) {
    let exchange = unique("contract.exchange");
    let queue = unique("contract.declare");

    for _ in 0..2 {
        adapter
            .declare_exchange(&exchange, ExchangeKind::Topic, &ExchangeOptions::default())
            .await
            .unwrap();
        adapter
            .declare_queue(&queue, &QueueOptions::with_dead_letter(&exchange, "dlq"))
            .await
            .unwrap();
        adapter.bind_queue(&queue, &exchange, "module.test.*").await.unwrap();
    }
}

/// Bus escalation: one delayed retry, then the dead-letter queue
pub async fn bus_retries_then_dead_letters(adapter: Arc<dyn QueueAdapter>) {
    let config = BusConfig {
        exchange: unique("contract.bus"),
        dead_letter_queue: unique("contract.bus.dlq"),
        default_queue: unique("contract.bus.default"),
        retry_policy: RetryPolicy {
            max_retries: 1,
            initial_delay_secs: 1,
            ..Default::default()
        },
    };
    let bus = AsyncEventBus::new(Arc::clone(&adapter), config.clone())
        .await
        .unwrap();

    let id = bus
        .publish_async(
            "order.created",
            serde_json::json!({"id": 42}),
            AsyncPublishOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();

    // Two attempts: the original and one retry, both failing
    let recorder = Recorder::default();
    let shutdown = CancellationToken::new();
    let handler = recorder.handler(usize::MAX, 2, shutdown.clone());
    tokio::time::timeout(
        CONSUME_TIMEOUT,
        bus.consume(handler, fast_options(&config.default_queue), shutdown),
    )
    .await
    .expect("consumer timed out")
    .unwrap();

    let attempts: Vec<u32> = recorder.seen().iter().map(|m| m.retry_count()).collect();
    assert_eq!(attempts, vec![0, 1]);

    // The dead letter is published before the second attempt is acknowledged
    let dlq = Recorder::default();
    consume_raw(&adapter, &config.dead_letter_queue, &dlq, 0, 1).await;

    let dead = dlq.seen();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id(), id);
    assert_eq!(dead[0].retry_count(), 1);
    let letter = DeadLetter::from_message(&dead[0]).unwrap();
    assert_eq!(letter.error, "attempt 2 fails");
    assert_eq!(letter.error_class, "TestFailure");
}
