//! Redis streams adapter
//!
//! Implements `QueueAdapter` over append-only streams with consumer groups.
//! Each queue is the stream `<namespace>:stream:<queue>`; entries carry the
//! envelope as flat string fields.
//!
//! There is no nack: an entry that is not acknowledged stays pending in the
//! group and is reclaimed by any consumer once it has been idle longer than
//! the visibility timeout. Delay queues (TTL + dead-letter target) are backed
//! by a sorted set that consumers of the target queue promote when due.
//!
//! Streams have no exchanges. Bindings are recorded locally and only used to
//! resolve dead-letter targets to queues.
//!
//! Requires Redis 6.2+ (`XPENDING ... IDLE`).

mod config;

pub use config::RedisStreamConfig;

use super::{topic_matches, DeliveryTracker, MessageHandler, QueueAdapter};
use crate::error::{QueueError, Result};
use crate::message::EventMessage;
use crate::types::{
    ConsumeOptions, DeadLetterTarget, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions,
};
use ::redis::aio::ConnectionManager;
use ::redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use ::redis::AsyncCommands;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Pending delivery of a stream entry
#[derive(Debug, Clone)]
struct StreamHandle {
    queue: String,
    group: String,
    entry_id: String,
    message: EventMessage,
}

/// Queue bound to an exchange under a routing pattern
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamBinding {
    queue: String,
    exchange: String,
    routing_key: String,
}

/// Moves one due member from the delay set into the stream atomically.
///
/// KEYS: delay set, stream. ARGV: member, MAXLEN ("" for none), field/value pairs.
/// Returns nil when another consumer already promoted the member. A failed
/// XADD puts the member back with its original score.
const PROMOTE_SCRIPT: &str = r"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
  return false
end
redis.call('ZREM', KEYS[1], ARGV[1])
local args = {KEYS[2]}
if ARGV[2] ~= '' then
  table.insert(args, 'MAXLEN')
  table.insert(args, '~')
  table.insert(args, ARGV[2])
end
table.insert(args, '*')
for i = 3, #ARGV do
  table.insert(args, ARGV[i])
end
local added = redis.pcall('XADD', unpack(args))
if type(added) == 'table' and added.err then
  redis.call('ZADD', KEYS[1], score, ARGV[1])
end
return added
";

/// Redis streams queue adapter
pub struct RedisStreamAdapter {
    client: ::redis::Client,
    conn: ConnectionManager,
    tracker: DeliveryTracker<StreamHandle>,
    declared: Mutex<HashMap<String, QueueOptions>>,
    bindings: Mutex<Vec<StreamBinding>>,
    promote_script: ::redis::Script,
    closed: AtomicBool,
    config: RedisStreamConfig,
}

impl RedisStreamAdapter {
    /// Connect to Redis
    pub async fn connect(config: RedisStreamConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::Config(format!("Invalid Redis URL '{}': {}", config.url, e)))?;

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                QueueError::Connection(format!(
                    "{}: timed out after {}s",
                    config.url, config.connect_timeout_secs
                ))
            })?
            .map_err(|e| QueueError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, namespace = %config.namespace, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            tracker: DeliveryTracker::new(),
            declared: Mutex::new(HashMap::new()),
            bindings: Mutex::new(Vec::new()),
            promote_script: ::redis::Script::new(PROMOTE_SCRIPT),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &RedisStreamConfig {
        &self.config
    }

    /// Ids delivered to this adapter and not yet resolved
    pub async fn unacknowledged(&self) -> Vec<String> {
        self.tracker.pending_ids().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("redis adapter closed".to_string()));
        }
        Ok(())
    }

    /// Create the consumer group at the start of the stream; an existing group is fine
    async fn ensure_group(&self, stream_key: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream_key, group, "0")
            .await
        {
            Ok(()) => {
                tracing::info!(stream = stream_key, group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append an envelope to a queue's stream
    async fn append(&self, queue: &str, message: &EventMessage) -> Result<Option<String>> {
        let fields = match entry_fields(message) {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!(message_id = %message.id(), queue, error = %e, "Message could not be encoded");
                return Ok(None);
            }
        };

        let stream_key = self.config.stream_key(queue);
        let mut conn = self.conn.clone();
        let entry_id: String = match self.max_length(queue).await {
            Some(max) => {
                conn.xadd_maxlen(&stream_key, StreamMaxlen::Approx(max), "*", fields.as_slice())
                    .await
            }
            None => conn.xadd(&stream_key, "*", fields.as_slice()).await,
        }
        .map_err(|e| publish_error(queue, e))?;

        tracing::debug!(
            message_id = %message.id(),
            queue,
            entry_id = %entry_id,
            event_name = %message.event_name(),
            "Message appended"
        );

        Ok(Some(message.id().to_string()))
    }

    async fn max_length(&self, queue: &str) -> Option<usize> {
        self.declared
            .lock()
            .await
            .get(queue)
            .and_then(|opts| opts.max_length)
    }

    /// Queues a dead-letter target resolves to through the recorded bindings
    async fn dead_letter_queues(&self, target: &DeadLetterTarget) -> Vec<String> {
        resolve_dead_letter(&self.bindings.lock().await, target)
    }

    /// Dead-letter target of a declared queue, if any
    async fn dead_letter_target(&self, queue: &str) -> Option<DeadLetterTarget> {
        self.declared
            .lock()
            .await
            .get(queue)
            .and_then(|opts| opts.dead_letter.clone())
    }

    /// Hold a message in the delay sets of its target queues until `ttl_ms` has passed
    async fn schedule(
        &self,
        queue: &str,
        target: &DeadLetterTarget,
        ttl_ms: u64,
        message: &EventMessage,
    ) -> Result<Option<String>> {
        let member = match message.to_json() {
            Ok(member) => member,
            Err(e) => {
                tracing::warn!(message_id = %message.id(), queue, error = %e, "Message could not be encoded");
                return Ok(None);
            }
        };
        let due_ms = now_ms().saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX));

        let mut conn = self.conn.clone();
        for target_queue in self.dead_letter_queues(target).await {
            conn.zadd::<_, _, _, ()>(self.config.delayed_key(&target_queue), &member, due_ms)
                .await
                .map_err(|e| publish_error(queue, e))?;

            tracing::debug!(
                message_id = %message.id(),
                delay_queue = queue,
                target = %target_queue,
                due_ms,
                "Message scheduled"
            );
        }

        Ok(Some(message.id().to_string()))
    }

    /// Move up to `limit` due entries from the delay set into the queue's stream
    ///
    /// Each move is one script call, so an entry is either still delayed or
    /// appended, never neither. Consumers call this on every loop iteration.
    pub async fn promote_due(&self, queue: &str, limit: usize) -> Result<usize> {
        self.ensure_open()?;
        let delayed_key = self.config.delayed_key(queue);
        let stream_key = self.config.stream_key(queue);
        let max_length = self
            .max_length(queue)
            .await
            .map(|max| max.to_string())
            .unwrap_or_default();
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(
                &delayed_key,
                "-inf",
                now_ms(),
                0,
                isize::try_from(limit.max(1)).unwrap_or(isize::MAX),
            )
            .await?;

        let mut promoted = 0;
        for member in due {
            let decoded = EventMessage::from_json(&member).and_then(|m| entry_fields(&m));
            let fields = match decoded {
                Ok(fields) => fields,
                Err(e) => {
                    tracing::error!(queue, error = %e, "Dropping undecodable delayed entry");
                    conn.zrem::<_, _, ()>(&delayed_key, &member).await?;
                    continue;
                }
            };

            let mut invocation = self.promote_script.prepare_invoke();
            invocation
                .key(&delayed_key)
                .key(&stream_key)
                .arg(&member)
                .arg(&max_length);
            for (name, value) in &fields {
                invocation.arg(*name).arg(value);
            }

            let entry_id: Option<String> = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| publish_error(queue, e))?;
            if entry_id.is_some() {
                promoted += 1;
            }
        }

        if promoted > 0 {
            tracing::debug!(queue, promoted, "Delayed messages promoted");
        }
        Ok(promoted)
    }

    /// Run one entry through the handler and resolve it if the handler did not
    async fn process_entry(
        &self,
        queue: &str,
        group: &str,
        handler: &MessageHandler,
        entry: StreamId,
    ) -> Result<()> {
        let stream_key = self.config.stream_key(queue);

        let message = match message_from_entry(&entry) {
            Ok(message) => message,
            Err(e) => {
                // Would be reclaimed forever otherwise
                tracing::error!(queue, entry_id = %entry.id, error = %e, "Undecodable entry dead-lettered");
                self.dead_letter_raw(queue, &entry).await?;
                let mut conn = self.conn.clone();
                conn.xack::<_, _, _, ()>(&stream_key, group, &[&entry.id])
                    .await
                    .map_err(|e| QueueError::Ack(e.to_string()))?;
                return Ok(());
            }
        };

        let message_id = message.id().to_string();
        self.tracker
            .record(
                &message_id,
                StreamHandle {
                    queue: queue.to_string(),
                    group: group.to_string(),
                    entry_id: entry.id.clone(),
                    message: message.clone(),
                },
            )
            .await;

        tracing::debug!(
            message_id = %message_id,
            queue,
            entry_id = %entry.id,
            retry_count = message.retry_count(),
            "Message received"
        );

        let outcome = handler(message).await;

        let Some(handle) = self.tracker.take(&message_id).await else {
            return Ok(());
        };

        match outcome {
            Ok(()) => self.ack_handle(&handle).await,
            Err(e) => {
                tracing::warn!(
                    message_id = %message_id,
                    queue,
                    entry_id = %handle.entry_id,
                    error = %e,
                    "Handler failed, entry left pending for reclaim"
                );
                Ok(())
            }
        }
    }

    /// Copy an entry's raw fields to the queue's dead-letter targets
    async fn dead_letter_raw(&self, queue: &str, entry: &StreamId) -> Result<()> {
        let Some(target) = self.dead_letter_target(queue).await else {
            tracing::warn!(queue, entry_id = %entry.id, "No dead-letter target, entry dropped");
            return Ok(());
        };

        let fields: Vec<(String, Vec<u8>)> = entry
            .map
            .iter()
            .filter_map(|(key, value)| {
                ::redis::from_redis_value::<Vec<u8>>(value)
                    .ok()
                    .map(|bytes| (key.clone(), bytes))
            })
            .collect();
        if fields.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        for dead_queue in self.dead_letter_queues(&target).await {
            conn.xadd::<_, _, _, _, ()>(self.config.stream_key(&dead_queue), "*", fields.as_slice())
                .await
                .map_err(|e| publish_error(&dead_queue, e))?;
        }
        Ok(())
    }

    /// Claim entries idle past the visibility timeout and run them through the handler
    ///
    /// The idle filter runs on the server, so entries claimed by an earlier
    /// pass drop out of the scan and the ones behind them get their turn.
    async fn reclaim(
        &self,
        queue: &str,
        consumer: &str,
        handler: &MessageHandler,
        options: &ConsumeOptions,
    ) -> Result<usize> {
        let stream_key = self.config.stream_key(queue);
        let group = options.consumer_group.as_str();
        let mut conn = self.conn.clone();

        let pending: StreamPendingCountReply = ::redis::cmd("XPENDING")
            .arg(&stream_key)
            .arg(group)
            .arg("IDLE")
            .arg(options.visibility_timeout_ms)
            .arg("-")
            .arg("+")
            .arg(options.batch_size.max(1))
            .query_async(&mut conn)
            .await?;

        let stale = stale_entry_ids(&pending, options.visibility_timeout_ms);
        if stale.is_empty() {
            return Ok(0);
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                &stream_key,
                group,
                consumer,
                options.visibility_timeout_ms,
                stale.as_slice(),
            )
            .await?;

        let count = claimed.ids.len();
        if count > 0 {
            tracing::info!(queue, consumer, count, "Reclaimed idle pending entries");
        }
        for entry in claimed.ids {
            self.process_entry(queue, group, handler, entry).await?;
        }
        Ok(count)
    }

    async fn ack_handle(&self, handle: &StreamHandle) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(
            self.config.stream_key(&handle.queue),
            &handle.group,
            &[&handle.entry_id],
        )
        .await
        .map_err(|e| QueueError::Ack(e.to_string()))
    }
}

#[async_trait]
impl QueueAdapter for RedisStreamAdapter {
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

        let delay = self
            .declared
            .lock()
            .await
            .get(queue)
            .filter(|opts| opts.is_delay_queue())
            .and_then(|opts| Some((opts.message_ttl_ms?, opts.dead_letter.clone()?)));

        match delay {
            Some((ttl_ms, target)) => self.schedule(queue, &target, ttl_ms, message).await,
            None => self.append(queue, message).await,
        }
    }

    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        options: &ConsumeOptions,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;

        let stream_key = self.config.stream_key(queue);
        let group = options.consumer_group.as_str();
        let consumer = options.resolve_consumer_name();
        self.ensure_group(&stream_key, group).await?;

        // Blocking reads get their own connection so they do not stall other commands
        let mut reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let batch = options.batch_size.max(1);
        let read_options = StreamReadOptions::default()
            .group(group, &consumer)
            .count(batch)
            .block(usize::try_from(options.block_timeout_ms.max(1)).unwrap_or(usize::MAX));

        let keys = [&stream_key];
        let ids = [">"];

        tracing::info!(queue, group, consumer = %consumer, "Stream consumer started");

        while !shutdown.is_cancelled() {
            self.promote_due(queue, batch).await?;

            let reply: Option<StreamReadReply> = tokio::select! {
                _ = shutdown.cancelled() => break,
                reply = reader.xread_options(&keys, &ids, &read_options) => {
                    reply.map_err(|e| QueueError::Consume {
                        queue: queue.to_string(),
                        reason: e.to_string(),
                    })?
                }
            };

            let entries = reply
                .into_iter()
                .flat_map(|reply| reply.keys)
                .flat_map(|key| key.ids);
            for entry in entries {
                self.process_entry(queue, group, &handler, entry).await?;
            }

            if let Err(e) = self.reclaim(queue, &consumer, &handler, options).await {
                tracing::warn!(queue, group, error = %e, "Pending reclaim failed");
            }
        }

        tracing::info!(queue, group, consumer = %consumer, "Stream consumer stopped");
        Ok(())
    }

    async fn acknowledge(&self, message_id: &str) -> Result<()> {
        if let Some(handle) = self.tracker.take(message_id).await {
            self.ack_handle(&handle).await?;
        }
        Ok(())
    }

    async fn reject(&self, message_id: &str, requeue: bool) -> Result<()> {
        let Some(handle) = self.tracker.take(message_id).await else {
            return Ok(());
        };

        if requeue {
            // Stays pending; the next reclaim after the visibility timeout redelivers it
            return Ok(());
        }

        if let Some(target) = self.dead_letter_target(&handle.queue).await {
            for dead_queue in self.dead_letter_queues(&target).await {
                self.append(&dead_queue, &handle.message).await?;
            }
        }
        self.ack_handle(&handle).await
    }

    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        self.ensure_open()?;
        {
            let mut declared = self.declared.lock().await;
            match declared.get(queue) {
                Some(existing) => {
                    if existing != options {
                        tracing::warn!(queue, "Queue already declared with different options, keeping original");
                    }
                    return Ok(());
                }
                None => {
                    declared.insert(queue.to_string(), options.clone());
                }
            }
        }

        if let Some(max) = options.max_length {
            let mut conn = self.conn.clone();
            conn.xtrim::<_, ()>(self.config.stream_key(queue), StreamMaxlen::Approx(max))
                .await
                .map_err(|e| QueueError::Declare {
                    name: queue.to_string(),
                    reason: e.to_string(),
                })?;
        }

        tracing::debug!(queue, ttl_ms = ?options.message_ttl_ms, "Queue declared");
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<()> {
        tracing::debug!(exchange, kind = kind.as_str(), "Exchanges are not used by streams");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let binding = StreamBinding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        let mut bindings = self.bindings.lock().await;
        if !bindings.contains(&binding) {
            tracing::debug!(queue, exchange, routing_key, "Binding recorded");
            bindings.push(binding);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.tracker.clear().await;
        Ok(())
    }
}

/// Flat string fields of a stream entry
fn entry_fields(message: &EventMessage) -> Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("id", message.id().to_string()),
        ("event_name", message.event_name().to_string()),
        ("payload", serde_json::to_string(message.payload())?),
        ("module_name", message.module_name().unwrap_or_default().to_string()),
        ("retry_count", message.retry_count().to_string()),
        ("timestamp", message.timestamp().to_string()),
        ("metadata", serde_json::to_string(message.metadata())?),
    ])
}

/// Rebuild an envelope from flat fields
///
/// An empty `module_name` means none; missing fields fall back to the
/// envelope defaults.
fn message_from_fields(fields: &HashMap<String, String>) -> Result<EventMessage> {
    let mut envelope = serde_json::Map::new();

    if let Some(id) = fields.get("id").filter(|id| !id.is_empty()) {
        envelope.insert("id".to_string(), Value::String(id.clone()));
    }
    if let Some(event_name) = fields.get("event_name") {
        envelope.insert("event_name".to_string(), Value::String(event_name.clone()));
    }
    if let Some(module) = fields.get("module_name").filter(|m| !m.is_empty()) {
        envelope.insert("module_name".to_string(), Value::String(module.clone()));
    }
    for key in ["payload", "metadata", "retry_count", "timestamp"] {
        if let Some(raw) = fields.get(key) {
            envelope.insert(key.to_string(), serde_json::from_str(raw)?);
        }
    }

    Ok(serde_json::from_value(Value::Object(envelope))?)
}

fn message_from_entry(entry: &StreamId) -> Result<EventMessage> {
    let mut fields = HashMap::with_capacity(entry.map.len());
    for (key, value) in &entry.map {
        let text: String = ::redis::from_redis_value(value)?;
        fields.insert(key.clone(), text);
    }
    message_from_fields(&fields)
}

/// Queues that receive a message dead-lettered to `target`
///
/// Bindings on the target exchange are matched as topic patterns. With no
/// matching binding (or the default exchange) the routing key names the queue.
fn resolve_dead_letter(bindings: &[StreamBinding], target: &DeadLetterTarget) -> Vec<String> {
    if target.exchange.is_empty() {
        return vec![target.routing_key.clone()];
    }

    let mut seen = HashSet::new();
    let queues: Vec<String> = bindings
        .iter()
        .filter(|b| b.exchange == target.exchange)
        .filter(|b| topic_matches(&b.routing_key, &target.routing_key))
        .filter(|b| seen.insert(b.queue.as_str()))
        .map(|b| b.queue.clone())
        .collect();

    if queues.is_empty() {
        vec![target.routing_key.clone()]
    } else {
        queues
    }
}

/// Pending entries idle for at least `visibility_timeout_ms`
fn stale_entry_ids(pending: &StreamPendingCountReply, visibility_timeout_ms: u64) -> Vec<String> {
    pending
        .ids
        .iter()
        .filter(|p| u64::try_from(p.last_delivered_ms).unwrap_or(u64::MAX) >= visibility_timeout_ms)
        .map(|p| p.id.clone())
        .collect()
}

fn publish_error(queue: &str, e: ::redis::RedisError) -> QueueError {
    match QueueError::from(e) {
        QueueError::Backend(reason) => QueueError::Publish {
            queue: queue.to_string(),
            reason,
        },
        other => other,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::redis::streams::StreamPendingId;
    use serde_json::json;

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_entry_fields_are_flat_strings() {
        let message = EventMessage::new("order.created", json!({"id": 42}))
            .with_id("evt-1")
            .with_timestamp(1_700_000_000)
            .with_metadata("trace_id", "abc");
        let fields = as_map(entry_fields(&message).unwrap());

        assert_eq!(fields["id"], "evt-1");
        assert_eq!(fields["event_name"], "order.created");
        assert_eq!(fields["payload"], r#"{"id":42}"#);
        assert_eq!(fields["module_name"], "");
        assert_eq!(fields["retry_count"], "0");
        assert_eq!(fields["timestamp"], "1700000000");
        assert_eq!(fields["metadata"], r#"{"trace_id":"abc"}"#);
    }

    #[test]
    fn test_fields_rebuild_envelope() {
        let message = EventMessage::new("invoice.paid", json!({"amount": 10, "lines": [1, 2]}))
            .with_module("billing")
            .with_metadata("error", "timeout")
            .with_retry()
            .with_retry();

        let rebuilt = message_from_fields(&as_map(entry_fields(&message).unwrap())).unwrap();
        assert_eq!(rebuilt, message);
    }

    #[test]
    fn test_empty_module_is_none() {
        let message = EventMessage::new("user.created", json!({}));
        let rebuilt = message_from_fields(&as_map(entry_fields(&message).unwrap())).unwrap();
        assert!(rebuilt.module_name().is_none());
    }

    #[test]
    fn test_sparse_fields_use_defaults() {
        let mut fields = HashMap::new();
        fields.insert("event_name".to_string(), "legacy.event".to_string());
        let message = message_from_fields(&fields).unwrap();

        assert!(message.id().starts_with("msg-"));
        assert_eq!(message.retry_count(), 0);
        assert!(message.timestamp() > 0);
    }

    #[test]
    fn test_malformed_fields_fail() {
        let mut fields = HashMap::new();
        fields.insert("payload".to_string(), "{broken".to_string());
        assert!(matches!(
            message_from_fields(&fields),
            Err(QueueError::Serialization(_))
        ));

        let mut fields = HashMap::new();
        fields.insert("retry_count".to_string(), "many".to_string());
        assert!(message_from_fields(&fields).is_err());
    }

    #[test]
    fn test_stale_entry_filter() {
        let pending = StreamPendingCountReply {
            ids: vec![
                StreamPendingId {
                    id: "1-0".to_string(),
                    consumer: "dead".to_string(),
                    last_delivered_ms: 90_000,
                    times_delivered: 1,
                },
                StreamPendingId {
                    id: "2-0".to_string(),
                    consumer: "alive".to_string(),
                    last_delivered_ms: 500,
                    times_delivered: 1,
                },
                StreamPendingId {
                    id: "3-0".to_string(),
                    consumer: "alive".to_string(),
                    last_delivered_ms: 60_000,
                    times_delivered: 3,
                },
            ],
        };

        assert_eq!(stale_entry_ids(&pending, 60_000), vec!["1-0", "3-0"]);
        assert!(stale_entry_ids(&pending, 120_000).is_empty());
    }

    fn binding(queue: &str, exchange: &str, routing_key: &str) -> StreamBinding {
        StreamBinding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    fn target(exchange: &str, routing_key: &str) -> DeadLetterTarget {
        DeadLetterTarget {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    #[test]
    fn test_dead_letter_resolves_through_bindings() {
        let bindings = vec![
            binding("a3s.events.dlq", "a3s.events", "dlq"),
            binding("a3s.events.default", "a3s.events", "a3s.events.default"),
            binding("billing", "a3s.events", "module.billing.*"),
            binding("other.dlq", "elsewhere", "dlq"),
        ];

        assert_eq!(
            resolve_dead_letter(&bindings, &target("a3s.events", "dlq")),
            vec!["a3s.events.dlq"]
        );
        assert_eq!(
            resolve_dead_letter(&bindings, &target("a3s.events", "a3s.events.default")),
            vec!["a3s.events.default"]
        );
    }

    #[test]
    fn test_dead_letter_resolves_each_queue_once() {
        let bindings = vec![
            binding("audit", "ex", "#"),
            binding("dead", "ex", "dlq"),
            binding("audit", "ex", "dlq"),
        ];
        assert_eq!(
            resolve_dead_letter(&bindings, &target("ex", "dlq")),
            vec!["audit", "dead"]
        );
    }

    #[test]
    fn test_unbound_dead_letter_names_the_queue() {
        let bindings = vec![binding("dead", "ex", "dlq")];
        assert_eq!(resolve_dead_letter(&bindings, &target("ex", "orders")), vec!["orders"]);
        assert_eq!(resolve_dead_letter(&bindings, &target("", "dlq")), vec!["dlq"]);
    }

    #[test]
    fn test_publish_error_keeps_connection_errors() {
        let refused = ::redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(publish_error("orders", refused), QueueError::Connection(_)));

        let other = ::redis::RedisError::from((::redis::ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(matches!(publish_error("orders", other), QueueError::Publish { .. }));
    }
}
