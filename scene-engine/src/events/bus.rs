// Event Bus
// In-process named-event pub/sub with one-shot listeners

use crate::state::Value;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot};

const BROADCAST_CAPACITY: usize = 256;

/// A published event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct BusInner {
    listeners: HashMap<String, Vec<(ListenerId, oneshot::Sender<Event>)>>,
    next_id: u64,
}

/// Named-event bus shared by scenes, responders and the orchestrator.
///
/// One-shot listeners are delivered at most once and removed on delivery.
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    all: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventBus")
            .field("events", &inner.listeners.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (all, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(BusInner::default())),
            all,
        }
    }

    /// Publish an event. Returns the number of one-shot listeners it reached.
    pub fn publish(&self, name: impl Into<String>, payload: impl Into<Value>) -> usize {
        let event = Event {
            name: name.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
        };

        let listeners = self
            .inner
            .lock()
            .listeners
            .remove(&event.name)
            .unwrap_or_default();

        let delivered = listeners
            .into_iter()
            .filter_map(|(_, sender)| sender.send(event.clone()).ok())
            .count();

        tracing::trace!(event = %event.name, delivered, "event published");
        let _ = self.all.send(event);
        delivered
    }

    /// Register a listener for the next occurrence of `name`.
    ///
    /// The returned listener is a future; dropping it before delivery
    /// deregisters it.
    pub fn subscribe_once(&self, name: impl Into<String>) -> EventListener {
        let name = name.into();
        let (sender, receiver) = oneshot::channel();

        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .listeners
            .entry(name.clone())
            .or_default()
            .push((id, sender));

        EventListener {
            id,
            name,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a pending listener. Returns false if it was already delivered or removed.
    pub fn unsubscribe(&self, name: &str, id: ListenerId) -> bool {
        remove_listener(&self.inner, name, id)
    }

    /// Observe every published event
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Number of pending one-shot listeners for an event
    pub fn listener_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .listeners
            .get(name)
            .map_or(0, Vec::len)
    }
}

fn remove_listener(inner: &Mutex<BusInner>, name: &str, id: ListenerId) -> bool {
    let mut inner = inner.lock();
    let Some(listeners) = inner.listeners.get_mut(name) else {
        return false;
    };

    let before = listeners.len();
    listeners.retain(|(listener, _)| *listener != id);
    let removed = listeners.len() != before;

    if listeners.is_empty() {
        inner.listeners.remove(name);
    }
    removed
}

/// Pending one-shot listener; resolves with the event or an error if the bus went away
pub struct EventListener {
    id: ListenerId,
    name: String,
    receiver: oneshot::Receiver<Event>,
    bus: Weak<Mutex<BusInner>>,
}

impl EventListener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event_name(&self) -> &str {
        &self.name
    }
}

impl Future for EventListener {
    type Output = Result<Event, oneshot::error::RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx)
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            remove_listener(&inner, &self.name, self.id);
        }
    }
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_once_delivers() {
        let bus = EventBus::new();
        let listener = bus.subscribe_once("done");

        assert_eq!(bus.publish("done", "payload"), 1);
        let event = listener.await.unwrap();
        assert_eq!(event.name, "done");
        assert_eq!(event.payload, Value::from("payload"));
    }

    #[tokio::test]
    async fn test_at_most_once_delivery() {
        let bus = EventBus::new();
        let _listener = bus.subscribe_once("done");

        assert_eq!(bus.publish("done", Value::Null), 1);
        assert_eq!(bus.publish("done", Value::Null), 0);
        assert_eq!(bus.listener_count("done"), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_listener() {
        let bus = EventBus::new();
        let first = bus.subscribe_once("arrived");
        let second = bus.subscribe_once("arrived");
        let _other = bus.subscribe_once("departed");

        assert_eq!(bus.publish("arrived", 7), 2);
        assert_eq!(first.await.unwrap().payload, Value::from(7));
        assert_eq!(second.await.unwrap().payload, Value::from(7));
        assert_eq!(bus.listener_count("departed"), 1);
    }

    #[test]
    fn test_drop_deregisters() {
        let bus = EventBus::new();
        let listener = bus.subscribe_once("done");
        assert_eq!(bus.listener_count("done"), 1);

        drop(listener);
        assert_eq!(bus.listener_count("done"), 0);
        assert_eq!(bus.publish("done", Value::Null), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let first = bus.subscribe_once("tick");
        let _second = bus.subscribe_once("tick");

        assert!(bus.unsubscribe("tick", first.id()));
        assert!(!bus.unsubscribe("tick", first.id()));
        assert_eq!(bus.listener_count("tick"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_all_sees_every_event() {
        let bus = EventBus::new();
        let mut all = bus.subscribe_all();

        bus.publish("a", 1);
        bus.publish("b", 2);

        assert_eq!(all.recv().await.unwrap().name, "a");
        assert_eq!(all.recv().await.unwrap().name, "b");
    }
}
