//! Synchronous in-process event bus
//!
//! Priority-ordered listener registry for fire-and-forget side effects that
//! don't need durability. Publishing runs every listener for the event on the
//! caller's thread, highest priority first; equal priorities keep
//! registration order.

use crate::adapter::HandlerResult;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Listener callback: `(payload, event_name)`
pub type ListenerFn = Arc<dyn Fn(&Value, &str) -> HandlerResult + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A registered listener
#[derive(Clone)]
pub struct Listener {
    pub id: ListenerId,
    pub priority: i32,
    pub callback: ListenerFn,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish()
    }
}

/// In-process listener registry
///
/// Safe to share between threads; reads take a snapshot so listeners may
/// subscribe or unsubscribe while a publish is running.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("EventBus").field("events", &events).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event_name`
    pub fn subscribe<F>(&self, event_name: &str, priority: i32, callback: F) -> ListenerId
    where
        F: Fn(&Value, &str) -> HandlerResult + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let entry = listeners.entry(event_name.to_string()).or_default();
        entry.push(Listener {
            id,
            priority,
            callback: Arc::new(callback),
        });
        // Stable: ties stay in registration order
        entry.sort_by(|a, b| b.priority.cmp(&a.priority));

        tracing::debug!(event_name, priority, listener = id.0, "Listener subscribed");
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, event_name: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = listeners.get_mut(event_name) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|l| l.id != id);
        let removed = entry.len() != before;
        if entry.is_empty() {
            listeners.remove(event_name);
        }
        removed
    }

    /// Invoke every listener for `event_name` in priority order
    ///
    /// Stops at the first listener that fails and returns its error.
    pub fn publish(&self, event_name: &str, payload: &Value) -> HandlerResult {
        for listener in self.listeners(event_name) {
            if let Err(e) = (listener.callback)(payload, event_name) {
                tracing::warn!(
                    event_name,
                    listener = listener.id.0,
                    error = %e,
                    "Listener failed, remaining listeners skipped"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn has_listeners(&self, event_name: &str) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .is_some_and(|l| !l.is_empty())
    }

    /// Snapshot of the listeners for `event_name`, in invocation order
    pub fn listeners(&self, event_name: &str) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::HandlerError;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> ListenerFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &str| -> ListenerFn {
                let log = log.clone();
                let name = name.to_string();
                Arc::new(move |_payload: &Value, _event: &str| {
                    log.lock().unwrap().push(name.clone());
                    Ok(())
                })
            }
        };
        (log, make)
    }

    fn subscribe_fn(bus: &EventBus, event: &str, priority: i32, f: ListenerFn) -> ListenerId {
        bus.subscribe(event, priority, move |p, e| f(p, e))
    }

    #[test]
    fn test_priority_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        subscribe_fn(&bus, "user.created", 5, make("low"));
        subscribe_fn(&bus, "user.created", 10, make("high"));

        bus.publish("user.created", &json!({"id": 1})).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        subscribe_fn(&bus, "a.b", 0, make("first"));
        subscribe_fn(&bus, "a.b", 0, make("second"));
        subscribe_fn(&bus, "a.b", 1, make("top"));
        subscribe_fn(&bus, "a.b", 0, make("third"));

        bus.publish("a.b", &Value::Null).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["top", "first", "second", "third"]);
    }

    #[test]
    fn test_listener_receives_payload_and_name() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        bus.subscribe("order.created", 0, move |payload, event| {
            *seen_clone.lock().unwrap() = Some((payload.clone(), event.to_string()));
            Ok(())
        });

        bus.publish("order.created", &json!({"id": 42})).unwrap();

        let (payload, event) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(payload["id"], 42);
        assert_eq!(event, "order.created");
    }

    #[test]
    fn test_publish_without_listeners() {
        let bus = EventBus::new();
        assert!(bus.publish("nobody.listens", &Value::Null).is_ok());
        assert!(!bus.has_listeners("nobody.listens"));
    }

    #[test]
    fn test_failure_stops_dispatch() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        subscribe_fn(&bus, "a.b", 10, make("before"));
        bus.subscribe("a.b", 5, |_, _| Err(HandlerError::msg("nope")));
        subscribe_fn(&bus, "a.b", 1, make("after"));

        let err = bus.publish("a.b", &Value::Null).unwrap_err();

        assert_eq!(err.message, "nope");
        assert_eq!(*log.lock().unwrap(), vec!["before"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let keep = subscribe_fn(&bus, "a.b", 0, make("keep"));
        let drop = subscribe_fn(&bus, "a.b", 0, make("drop"));

        assert!(bus.unsubscribe("a.b", drop));
        assert!(!bus.unsubscribe("a.b", drop));
        bus.publish("a.b", &Value::Null).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["keep"]);
        assert!(bus.unsubscribe("a.b", keep));
        assert!(!bus.has_listeners("a.b"));
    }

    #[test]
    fn test_listener_can_subscribe_during_publish() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe("a.b", 0, move |_, _| {
            inner.subscribe("a.b", 0, |_, _| Ok(()));
            Ok(())
        });

        bus.publish("a.b", &Value::Null).unwrap();
        assert_eq!(bus.listeners("a.b").len(), 2);
    }

    #[test]
    fn test_listeners_snapshot_order() {
        let bus = EventBus::new();
        bus.subscribe("a.b", 1, |_, _| Ok(()));
        bus.subscribe("a.b", 7, |_, _| Ok(()));

        let priorities: Vec<i32> = bus.listeners("a.b").iter().map(|l| l.priority).collect();
        assert_eq!(priorities, vec![7, 1]);
    }

    #[test]
    fn test_serde_error_converts_to_handler_error() {
        let bus = EventBus::new();
        bus.subscribe("a.b", 0, |payload, _| {
            let _id: u64 = serde_json::from_value(payload["id"].clone())?;
            Ok(())
        });

        let err = bus.publish("a.b", &json!({"id": "not-a-number"})).unwrap_err();
        assert!(err.class.contains("serde_json"));
    }
}
