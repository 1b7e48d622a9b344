// State Store
// Versioned dotted-path state with change subscriptions

use crate::state::value::Value;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Point-in-time copy of every stored path
pub type StateSnapshot = HashMap<String, Value>;

/// Callback invoked for every matching write
pub type ChangeCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// A single write as seen by subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Path that was written
    pub path: String,
    /// Value after the write
    pub new_value: Value,
    /// Value before the write (None if the path was new)
    pub old_value: Option<Value>,
    /// Version of the path after the write
    pub version: u64,
}

/// Options for [`StateStore::subscribe`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Also notify for writes below the subscribed path
    pub deep: bool,
}

impl SubscribeOptions {
    pub fn deep() -> Self {
        Self { deep: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Default)]
struct StateEntry {
    value: Value,
    version: u64,
}

struct Subscriber {
    id: SubscriptionId,
    path: String,
    deep: bool,
    callback: ChangeCallback,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, StateEntry>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
}

/// Shared state store. Cloning yields another handle to the same state.
///
/// `set_value` is the only mutation entry point. It is serialized by an
/// internal lock, and subscribers are called after the lock is released so
/// they may read or write the store again from inside the callback.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateStore")
            .field("paths", &inner.entries.len())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with initial values (no notifications)
    pub fn with_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for (path, value) in values {
                inner.entries.insert(path, StateEntry { value, version: 1 });
            }
        }
        store
    }

    /// Write a value and notify every matching subscriber. Returns the new version.
    pub fn set_value(&self, path: impl Into<String>, value: impl Into<Value>) -> u64 {
        let path = path.into();
        let value = value.into();

        let (change, callbacks) = {
            let mut inner = self.inner.lock();
            let entry = inner.entries.entry(path.clone()).or_default();
            let existed = entry.version > 0;
            let old_value = std::mem::replace(&mut entry.value, value.clone());
            entry.version += 1;

            let change = StateChange {
                path: path.clone(),
                new_value: value,
                old_value: existed.then_some(old_value),
                version: entry.version,
            };

            let callbacks: Vec<ChangeCallback> = inner
                .subscribers
                .iter()
                .filter(|s| path_matches(&s.path, s.deep, &path))
                .map(|s| s.callback.clone())
                .collect();

            (change, callbacks)
        };

        tracing::trace!(
            path = %change.path,
            version = change.version,
            subscribers = callbacks.len(),
            "State updated"
        );

        for callback in callbacks {
            callback(&change);
        }

        change.version
    }

    /// Apply several writes in order; each one notifies independently
    pub fn set_many<I, K, V>(&self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (path, value) in values {
            self.set_value(path, value);
        }
    }

    /// Read a path. Falls back to navigating into a stored ancestor object.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(path) {
            return Some(entry.value.clone());
        }

        let mut prefix = path;
        while let Some((parent, _)) = prefix.rsplit_once('.') {
            if let Some(entry) = inner.entries.get(parent) {
                let rest = &path[parent.len() + 1..];
                return entry.value.get_path(rest.split('.')).cloned();
            }
            prefix = parent;
        }

        None
    }

    /// Current version of a path (0 if never written)
    pub fn version(&self, path: &str) -> u64 {
        self.inner
            .lock()
            .entries
            .get(path)
            .map(|e| e.version)
            .unwrap_or(0)
    }

    pub fn get_snapshot(&self) -> StateSnapshot {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register interest in a path (or its subtree when `deep`).
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe<F>(
        &self,
        path: impl Into<String>,
        callback: F,
        options: SubscribeOptions,
    ) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);

        inner.subscribers.push(Subscriber {
            id,
            path: path.into(),
            deep: options.deep,
            callback: Arc::new(callback),
        });

        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn remove_subscriber(inner: &Mutex<StoreInner>, id: SubscriptionId) -> bool {
        let mut inner = inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len() != before
    }
}

/// Handle for a store subscription; unsubscribes on drop
pub struct Subscription {
    id: SubscriptionId,
    store: Weak<Mutex<StoreInner>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Explicitly release the subscription
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            StateStore::remove_subscriber(&inner, self.id);
        }
    }
}

/// Whether a write to `changed` concerns a subscriber on `subscribed`
fn path_matches(subscribed: &str, deep: bool, changed: &str) -> bool {
    if subscribed == changed {
        return true;
    }
    // An ancestor was replaced wholesale
    if is_descendant(subscribed, changed) {
        return true;
    }
    deep && (subscribed.is_empty() || is_descendant(changed, subscribed))
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    !ancestor.is_empty()
        && path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&StateChange) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move |_: &StateChange| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_set_and_get() {
        let store = StateStore::new();
        assert_eq!(store.set_value("agv1.sensor", 3.0), 1);
        assert_eq!(store.set_value("agv1.sensor", 4.0), 2);

        assert_eq!(store.get_value("agv1.sensor"), Some(Value::Number(4.0)));
        assert_eq!(store.version("agv1.sensor"), 2);
        assert_eq!(store.version("missing"), 0);
        assert_eq!(store.get_value("missing"), None);
    }

    #[test]
    fn test_get_value_navigates_ancestor_object() {
        let store = StateStore::new();
        store.set_value(
            "agv1",
            Value::Object(HashMap::from([("sensor".to_string(), Value::from(7.0))])),
        );

        assert_eq!(store.get_value("agv1.sensor"), Some(Value::Number(7.0)));
        assert_eq!(store.get_value("agv1.motor"), None);
    }

    #[test]
    fn test_subscriber_receives_old_and_new() {
        let store = StateStore::new();
        store.set_value("temperature", 20.0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.subscribe(
            "temperature",
            move |change| sink.lock().push(change.clone()),
            SubscribeOptions::default(),
        );

        store.set_value("temperature", 26.5);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "temperature");
        assert_eq!(seen[0].old_value, Some(Value::Number(20.0)));
        assert_eq!(seen[0].new_value, Value::Number(26.5));
        assert_eq!(seen[0].version, 2);
    }

    #[test]
    fn test_repeated_writes_each_notify() {
        let store = StateStore::new();
        let (count, callback) = counter();
        let _sub = store.subscribe("x", callback, SubscribeOptions::default());

        store.set_value("x", true);
        store.set_value("x", true);
        store.set_value("x", true);

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unrelated_paths_do_not_notify() {
        let store = StateStore::new();
        let (count, callback) = counter();
        let _sub = store.subscribe("agv1.sensor", callback, SubscribeOptions::default());

        store.set_value("agv2.sensor", 1.0);
        store.set_value("agv1.sensor_raw", 1.0);
        store.set_value("agv1.sensor.detail", 1.0);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deep_subscription() {
        let store = StateStore::new();
        let (count, callback) = counter();
        let _sub = store.subscribe("agv1", callback, SubscribeOptions::deep());

        store.set_value("agv1.sensor", 1.0);
        store.set_value("agv1.motor.rpm", 1200.0);
        store.set_value("agv2.sensor", 1.0);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ancestor_write_notifies_descendant_subscriber() {
        let store = StateStore::new();
        let (count, callback) = counter();
        let _sub = store.subscribe("agv1.sensor", callback, SubscribeOptions::default());

        store.set_value("agv1", Value::Object(HashMap::new()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let store = StateStore::new();
        let (count, callback) = counter();
        let sub = store.subscribe("x", callback, SubscribeOptions::default());
        assert_eq!(store.subscriber_count(), 1);

        sub.unsubscribe();
        store.set_value("x", 1.0);

        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_can_write_reentrantly() {
        let store = StateStore::new();
        let writer = store.clone();
        let _sub = store.subscribe(
            "input",
            move |change| {
                writer.set_value("mirror", change.new_value.clone());
            },
            SubscribeOptions::default(),
        );

        store.set_value("input", "ping");

        assert_eq!(store.get_value("mirror"), Some(Value::from("ping")));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = StateStore::with_values([("a".to_string(), Value::from(1.0))]);
        let snapshot = store.get_snapshot();
        store.set_value("a", 2.0);

        assert_eq!(snapshot.get("a"), Some(&Value::Number(1.0)));
        assert_eq!(store.get_value("a"), Some(Value::Number(2.0)));
    }
}
