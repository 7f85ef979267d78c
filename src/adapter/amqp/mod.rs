//! AMQP broker adapter
//!
//! Implements `QueueAdapter` over a topic-exchange broker (RabbitMQ) using
//! `lapin`. Messages are persistent, publishes are confirmed, and delayed
//! redelivery uses TTL queues that dead-letter back to the main exchange.
//!
//! Delivery tags are channel-scoped: handles recorded before a reconnect
//! cannot be acknowledged afterwards.

mod config;

pub use config::AmqpConfig;

use super::{DeliveryTracker, MessageHandler, QueueAdapter};
use crate::error::{QueueError, Result};
use crate::message::EventMessage;
use crate::types::{ConsumeOptions, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

/// AMQP queue adapter
pub struct AmqpAdapter {
    connection: Arc<Connection>,
    channel: Channel,
    tracker: DeliveryTracker<u64>,
    declared_queues: Mutex<HashMap<String, QueueOptions>>,
    declared_exchanges: Mutex<HashSet<String>>,
    closed: AtomicBool,
    config: AmqpConfig,
}

impl AmqpAdapter {
    /// Connect, open a channel and enable publisher confirms
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let connection =
            tokio::time::timeout(timeout, Connection::connect(&config.url, ConnectionProperties::default()))
                .await
                .map_err(|_| {
                    QueueError::Connection(format!(
                        "{}: timed out after {}s",
                        config.url, config.connect_timeout_secs
                    ))
                })?
                .map_err(|e| QueueError::Connection(format!("{}: {}", config.url, e)))?;

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        tracing::info!(url = %config.url, "Connected to AMQP broker");

        Ok(Self {
            connection: Arc::new(connection),
            channel,
            tracker: DeliveryTracker::new(),
            declared_queues: Mutex::new(HashMap::new()),
            declared_exchanges: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    /// Ids delivered on this channel and not yet resolved
    pub async fn unacknowledged(&self) -> Vec<String> {
        self.tracker.pending_ids().await
    }

    async fn handle_delivery(
        &self,
        queue: &str,
        handler: &MessageHandler,
        delivery_tag: u64,
        data: &[u8],
    ) -> Result<()> {
        let message = match EventMessage::from_slice(data) {
            Ok(message) => message,
            Err(e) => {
                // Cannot be retried without an envelope; dead-letter if the queue has a target
                tracing::warn!(queue, delivery_tag, error = %e, "Undecodable message rejected");
                self.channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| QueueError::Ack(e.to_string()))?;
                return Ok(());
            }
        };

        let message_id = message.id().to_string();
        self.tracker.record(&message_id, delivery_tag).await;

        tracing::debug!(
            message_id = %message_id,
            queue,
            event_name = %message.event_name(),
            retry_count = message.retry_count(),
            "Message received"
        );

        let outcome = handler(message).await;

        let Some(tag) = self.tracker.take(&message_id).await else {
            return Ok(());
        };

        match outcome {
            Ok(()) => self
                .channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(|e| QueueError::Ack(e.to_string())),
            Err(e) => {
                tracing::warn!(message_id = %message_id, queue, error = %e, "Handler failed, requeueing");
                self.channel
                    .basic_nack(
                        tag,
                        BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| QueueError::Ack(e.to_string()))
            }
        }
    }

    async fn ensure_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        if self.declared_queues.lock().await.contains_key(queue) {
            return Ok(());
        }
        self.declare_queue(queue, options).await
    }
}

#[async_trait]
impl QueueAdapter for AmqpAdapter {
    async fn publish(
        &self,
        queue: &str,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> Result<Option<String>> {
        let payload = match message.to_vec() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(message_id = %message.id(), queue, error = %e, "Message could not be encoded");
                return Ok(None);
            }
        };

        let exchange = options.exchange.as_deref().unwrap_or("");
        let routing_key = options.routing_key.as_deref().unwrap_or(queue);

        if exchange.is_empty() {
            let queue_options = options.queue_options.clone().unwrap_or_default();
            self.ensure_queue(queue, &queue_options).await?;
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                message_properties(message),
            )
            .await
            .map_err(|e| QueueError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| QueueError::Publish {
                queue: queue.to_string(),
                reason: format!("confirm failed: {}", e),
            })?;

        if confirmation.is_nack() {
            tracing::warn!(message_id = %message.id(), queue, "Broker nacked publish");
            return Ok(None);
        }

        tracing::debug!(
            message_id = %message.id(),
            queue,
            exchange,
            routing_key,
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
        let consumer_tag = options.resolve_consumer_name();

        self.channel
            .basic_qos(
                self.config.prefetch_for(options.batch_size),
                BasicQosOptions::default(),
            )
            .await?;

        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(queue, consumer = %consumer_tag, "AMQP consumer started");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        return Err(QueueError::Consume {
                            queue: queue.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        tracing::info!(queue, "Broker ended the delivery stream");
                        return Ok(());
                    }
                },
            };

            self.handle_delivery(queue, &handler, delivery.delivery_tag, &delivery.data)
                .await?;
        }

        self.channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await?;

        tracing::info!(queue, consumer = %consumer_tag, "AMQP consumer stopped");
        Ok(())
    }

    async fn acknowledge(&self, message_id: &str) -> Result<()> {
        if let Some(tag) = self.tracker.take(message_id).await {
            self.channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(|e| QueueError::Ack(e.to_string()))?;
        }
        Ok(())
    }

    async fn reject(&self, message_id: &str, requeue: bool) -> Result<()> {
        if let Some(tag) = self.tracker.take(message_id).await {
            self.channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        requeue,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| QueueError::Ack(e.to_string()))?;
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        let mut declared = self.declared_queues.lock().await;
        if let Some(existing) = declared.get(queue) {
            if existing != options {
                // Redeclaring with other arguments would close the channel
                tracing::warn!(queue, "Queue already declared with different options, keeping original");
            }
            return Ok(());
        }

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await
            .map_err(|e| QueueError::Declare {
                name: queue.to_string(),
                reason: e.to_string(),
            })?;

        declared.insert(queue.to_string(), options.clone());
        tracing::debug!(queue, ttl_ms = ?options.message_ttl_ms, "Queue declared");
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        let mut declared = self.declared_exchanges.lock().await;
        if declared.contains(exchange) {
            return Ok(());
        }

        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declare {
                name: exchange.to_string(),
                reason: e.to_string(),
            })?;

        declared.insert(exchange.to_string());
        tracing::debug!(exchange, kind = kind.as_str(), "Exchange declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declare {
                name: format!("{} -> {}", exchange, queue),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn name(&self) -> &str {
        "amqp"
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.tracker.clear().await;
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "closing").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "closing").await?;
        }
        tracing::info!("AMQP connection closed");
        Ok(())
    }
}

impl Drop for AmqpAdapter {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = Arc::clone(&self.connection);
        runtime.spawn(async move {
            if connection.status().connected() {
                if let Err(e) = connection.close(REPLY_SUCCESS, "dropped").await {
                    tracing::debug!(error = %e, "AMQP close on drop failed");
                }
            }
        });
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// `x-message-ttl`, `x-dead-letter-exchange`, `x-dead-letter-routing-key`, `x-max-length`
fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = options.message_ttl_ms {
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(i64::try_from(ttl).unwrap_or(i64::MAX)),
        );
    }
    if let Some(ref target) = options.dead_letter {
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(target.exchange.as_str())),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(target.routing_key.as_str())),
        );
    }
    if let Some(max_length) = options.max_length {
        args.insert(
            ShortString::from("x-max-length"),
            AMQPValue::LongLongInt(i64::try_from(max_length).unwrap_or(i64::MAX)),
        );
    }
    args
}

/// Headers mirroring the routing fields of the envelope
fn message_headers(message: &EventMessage) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("event_name"),
        AMQPValue::LongString(LongString::from(message.event_name())),
    );
    headers.insert(
        ShortString::from("module_name"),
        match message.module_name() {
            Some(module) => AMQPValue::LongString(LongString::from(module)),
            None => AMQPValue::Void,
        },
    );
    headers.insert(
        ShortString::from("retry_count"),
        AMQPValue::LongLongInt(i64::from(message.retry_count())),
    );
    headers
}

fn message_properties(message: &EventMessage) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_content_type(ShortString::from("application/json"))
        .with_message_id(ShortString::from(message.id()))
        .with_timestamp(u64::try_from(message.timestamp()).unwrap_or_default())
        .with_headers(message_headers(message))
}
