//! In-process event bus with per-topic listeners.
//!
//! [`EventBus`] fans out named [`Event`]s from the transport to any
//! number of local listeners. Dispatch is synchronous and follows
//! registration order within a topic. Listener failures (an `Err` return
//! or a panic) are logged and never stop delivery to the remaining
//! listeners.
//!
//! Registration returns a [`Subscription`] handle. Dropping the handle or
//! calling [`Subscription::unsubscribe`] revokes the listener; a revoked
//! listener is never invoked again, even if a dispatch that already
//! started has not reached it yet.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use newsdesk_core::job_events::{
    MSG_TYPE_CLOSE, MSG_TYPE_CONNECTED, MSG_TYPE_ERROR, MSG_TYPE_JOB_STATUS,
};
use newsdesk_core::types::Timestamp;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Topic / Event
// ---------------------------------------------------------------------------

/// A named channel of events.
///
/// The four topics the tracker reacts to are variants; any other frame
/// type coming off the wire is carried as [`Topic::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Connected,
    Error,
    Close,
    JobStatus,
    Custom(String),
}

impl Topic {
    /// Map a wire `type` string onto a topic.
    pub fn from_frame_type(kind: &str) -> Self {
        match kind {
            MSG_TYPE_CONNECTED => Topic::Connected,
            MSG_TYPE_ERROR => Topic::Error,
            MSG_TYPE_CLOSE => Topic::Close,
            MSG_TYPE_JOB_STATUS => Topic::JobStatus,
            other => Topic::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Topic::Connected => MSG_TYPE_CONNECTED,
            Topic::Error => MSG_TYPE_ERROR,
            Topic::Close => MSG_TYPE_CLOSE,
            Topic::JobStatus => MSG_TYPE_JOB_STATUS,
            Topic::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event delivered through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    /// Free-form payload; for `job_status` its only contract is "re-fetch".
    pub payload: serde_json::Value,
    pub emitted_at: Timestamp,
}

impl Event {
    /// Create an event with an empty object payload.
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            payload: serde_json::Value::Object(Default::default()),
            emitted_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Listener callback. Shareable so one instance can serve several topics.
pub type Callback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Listener {
    id: u64,
    topic: Topic,
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<Listener>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // Callbacks never run under this lock, so a poisoned guard still holds
    // a consistent listener list.
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process publish/subscribe hub.
///
/// Designed to be shared via `Arc<EventBus>`. Listeners may call back
/// into the bus (register, unsubscribe, emit) from inside a callback.
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Register `callback` for `topic`.
    pub fn on<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_callback(topic, Arc::new(callback))
    }

    /// Register an already shared callback for `topic`.
    pub fn on_callback(&self, topic: Topic, callback: Callback) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;

        tracing::debug!(listener_id = id, topic = %topic, "Registering event listener");
        registry.listeners.push(Listener {
            id,
            topic: topic.clone(),
            active: Arc::clone(&active),
            callback,
        });

        Subscription {
            id,
            topic,
            active,
            registry: Arc::downgrade(&self.registry),
            detached: false,
        }
    }

    /// Emit `payload` on `topic`. Returns how many listeners were invoked.
    pub fn emit(&self, topic: Topic, payload: serde_json::Value) -> usize {
        self.publish(Event::new(topic).with_payload(payload))
    }

    /// Deliver `event` to every live listener of its topic, in
    /// registration order. Returns how many listeners were invoked.
    pub fn publish(&self, event: Event) -> usize {
        let targets: Vec<(u64, Arc<AtomicBool>, Callback)> = lock(&self.registry)
            .listeners
            .iter()
            .filter(|l| l.topic == event.topic)
            .map(|l| (l.id, Arc::clone(&l.active), Arc::clone(&l.callback)))
            .collect();

        let mut invoked = 0;
        for (id, active, callback) in targets {
            // An earlier listener in this dispatch may have revoked this one.
            if !active.load(Ordering::Acquire) {
                continue;
            }
            invoked += 1;

            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        listener_id = id,
                        topic = %event.topic,
                        error = %e,
                        "Event listener failed",
                    );
                }
                Err(_) => {
                    tracing::error!(
                        listener_id = id,
                        topic = %event.topic,
                        "Event listener panicked",
                    );
                }
            }
        }
        invoked
    }

    /// Number of live listeners registered for `topic`.
    pub fn listener_count(&self, topic: &Topic) -> usize {
        lock(&self.registry)
            .listeners
            .iter()
            .filter(|l| &l.topic == topic)
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Revocable handle for one registered listener.
///
/// Dropping the handle unsubscribes, unless [`detach`](Self::detach) was
/// called to keep the listener for the lifetime of the bus.
pub struct Subscription {
    id: u64,
    topic: Topic,
    active: Arc<AtomicBool>,
    registry: Weak<Mutex<Registry>>,
    detached: bool,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Revoke the listener. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.retain(|l| l.id != self.id);
            tracing::debug!(listener_id = self.id, topic = %self.topic, "Event listener removed");
        }
    }

    /// Keep the listener registered after this handle is dropped.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |name: &'static str| -> Callback {
            let log = Arc::clone(&log_clone);
            Arc::new(move |_event: &Event| {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn emit_without_listeners_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(Topic::JobStatus, serde_json::json!({})), 0);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let _a = bus.on_callback(Topic::JobStatus, make("a"));
        let _b = bus.on_callback(Topic::JobStatus, make("b"));
        let _c = bus.on_callback(Topic::JobStatus, make("c"));

        assert_eq!(bus.emit(Topic::JobStatus, serde_json::Value::Null), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn only_matching_topic_is_dispatched() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let _a = bus.on_callback(Topic::Connected, make("connected"));
        let _b = bus.on_callback(Topic::Custom("digest".into()), make("digest"));

        bus.emit(Topic::Custom("digest".into()), serde_json::Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["digest"]);
    }

    #[test]
    fn failing_listener_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let _a = bus.on(Topic::JobStatus, |_| anyhow::bail!("render failed"));
        let _b = bus.on(Topic::JobStatus, |_| panic!("listener bug"));
        let _c = bus.on_callback(Topic::JobStatus, make("c"));

        assert_eq!(bus.emit(Topic::JobStatus, serde_json::Value::Null), 3);
        assert_eq!(*log.lock().unwrap(), vec!["c"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let sub = bus.on(Topic::Close, |_| Ok(()));
        assert_eq!(bus.listener_count(&Topic::Close), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.listener_count(&Topic::Close), 0);
    }

    #[test]
    fn dropping_subscription_revokes_listener() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let sub = bus.on(Topic::JobStatus, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        drop(sub);

        bus.emit(Topic::JobStatus, serde_json::Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn detached_subscription_outlives_handle() {
        let bus = EventBus::new();
        bus.on(Topic::Error, |_| Ok(())).detach();
        assert_eq!(bus.listener_count(&Topic::Error), 1);
    }

    #[test]
    fn same_callback_on_multiple_topics() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let callback: Callback = Arc::new(move |_: &Event| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let _a = bus.on_callback(Topic::Connected, Arc::clone(&callback));
        let b = bus.on_callback(Topic::JobStatus, callback);

        bus.emit(Topic::Connected, serde_json::Value::Null);
        bus.emit(Topic::JobStatus, serde_json::Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        b.unsubscribe();
        bus.emit(Topic::JobStatus, serde_json::Value::Null);
        bus.emit(Topic::Connected, serde_json::Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn listener_revoked_mid_dispatch_is_skipped() {
        let bus = Arc::new(EventBus::new());
        let (log, make) = recorder();

        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let victim_clone = Arc::clone(&victim);
        let _first = bus.on(Topic::JobStatus, move |_| {
            if let Some(sub) = victim_clone.lock().unwrap().take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *victim.lock().unwrap() = Some(bus.on_callback(Topic::JobStatus, make("victim")));
        let _last = bus.on_callback(Topic::JobStatus, make("last"));

        assert_eq!(bus.emit(Topic::JobStatus, serde_json::Value::Null), 2);
        assert_eq!(*log.lock().unwrap(), vec!["last"]);
    }

    #[test]
    fn listener_may_reenter_bus() {
        let bus = Arc::new(EventBus::new());
        let (log, make) = recorder();
        let _sink = bus.on_callback(Topic::Custom("echo".into()), make("echo"));

        let bus_clone = Arc::clone(&bus);
        let _relay = bus.on(Topic::JobStatus, move |event| {
            bus_clone.emit(Topic::Custom("echo".into()), event.payload.clone());
            Ok(())
        });

        bus.emit(Topic::JobStatus, serde_json::json!({"id": 1}));
        assert_eq!(*log.lock().unwrap(), vec!["echo"]);
    }

    #[test]
    fn topic_round_trips_through_frame_type() {
        assert_eq!(Topic::from_frame_type("job_status"), Topic::JobStatus);
        assert_eq!(Topic::from_frame_type("connected"), Topic::Connected);
        assert_eq!(
            Topic::from_frame_type("article_added"),
            Topic::Custom("article_added".into())
        );
        assert_eq!(Topic::JobStatus.as_str(), "job_status");
    }

    #[tokio::test]
    async fn listeners_work_from_spawned_tasks() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let _sub = bus.on(Topic::JobStatus, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let bus_clone = Arc::clone(&bus);
        tokio::spawn(async move {
            bus_clone.emit(Topic::JobStatus, serde_json::Value::Null);
        })
        .await
        .expect("emit task should not panic");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
