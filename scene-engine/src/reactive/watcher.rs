// Reactive Condition Watcher
// Subscribes each condition to the state paths it reads and edge-triggers callbacks

use crate::config::WatcherConfig;
use crate::events::{LogRecord, RecordKind, RecordResult, RecordSender, RecordSink};
use crate::expression::{extract_dependencies, ExpressionEvaluator};
use crate::reactive::condition::{
    Condition, ConditionCallback, ConditionStats, ConditionTrigger, Evaluation, RemovalReason,
    WatchOptions,
};
use crate::state::{StateChange, StateStore, SubscribeOptions, Subscription};

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("condition id must not be empty")]
    EmptyId,

    #[error("condition '{0}' needs a Tokio runtime for polling or timeout")]
    NoRuntime(String),
}

/// Handle returned by [`ReactiveConditionWatcher::watch_condition`].
///
/// Dropping the handle keeps the condition alive; call [`WatchHandle::unwatch`]
/// to remove it. A handle never removes a later registration that reused its id.
pub struct WatchHandle {
    id: String,
    generation: u64,
    watcher: Weak<WatcherInner>,
}

impl WatchHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the condition. Returns false if it was already gone.
    pub fn unwatch(self) -> bool {
        match self.watcher.upgrade() {
            Some(inner) => {
                inner.remove_generation(&self.id, self.generation, RemovalReason::Unwatched)
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.watcher.upgrade().is_some_and(|inner| {
            inner
                .state
                .lock()
                .conditions
                .get(&self.id)
                .is_some_and(|c| c.generation == self.generation)
        })
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// One store subscription shared by every condition reading the path
struct PathWatch {
    _subscription: Subscription,
    ids: Vec<String>,
}

#[derive(Default)]
struct WatcherState {
    conditions: HashMap<String, Condition>,
    paths: HashMap<String, PathWatch>,
    next_sequence: u64,
}

struct WatcherInner {
    store: StateStore,
    evaluator: Arc<dyn ExpressionEvaluator>,
    config: WatcherConfig,
    records: Option<RecordSender>,
    state: Mutex<WatcherState>,
}

/// Dependency-tracked condition watcher.
///
/// Evaluation runs inline inside the `set_value` call that changed a
/// dependency; only conditions without usable dependencies are polled.
#[derive(Clone)]
pub struct ReactiveConditionWatcher {
    inner: Arc<WatcherInner>,
}

impl fmt::Debug for ReactiveConditionWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ReactiveConditionWatcher")
            .field("conditions", &state.conditions.len())
            .field("paths", &state.paths.len())
            .finish()
    }
}

impl ReactiveConditionWatcher {
    pub fn new(
        store: StateStore,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: WatcherConfig,
    ) -> Self {
        Self::with_records(store, evaluator, config, None)
    }

    /// Create a watcher that forwards condition records to a sink
    pub fn with_records(
        store: StateStore,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: WatcherConfig,
        records: Option<RecordSender>,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                store,
                evaluator,
                config,
                records,
                state: Mutex::new(WatcherState::default()),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Register a condition. Re-registering an id replaces the old condition.
    ///
    /// The condition is evaluated once immediately, so a condition that is
    /// already true fires right away.
    pub fn watch_condition<F>(
        &self,
        id: impl Into<String>,
        expression: impl Into<String>,
        callback: F,
        options: WatchOptions,
    ) -> Result<WatchHandle, WatchError>
    where
        F: Fn(&ConditionTrigger) + Send + Sync + 'static,
    {
        self.watch_arc(id.into(), expression.into(), Arc::new(callback), options)
    }

    fn watch_arc(
        &self,
        id: String,
        expression: String,
        callback: ConditionCallback,
        options: WatchOptions,
    ) -> Result<WatchHandle, WatchError> {
        if id.is_empty() {
            return Err(WatchError::EmptyId);
        }

        let dependencies = extract_dependencies(&expression);
        let polling =
            dependencies.is_empty() || dependencies.len() > self.inner.config.max_dependencies;

        let runtime = if polling || options.timeout_ms.is_some() {
            Some(Handle::try_current().map_err(|_| WatchError::NoRuntime(id.clone()))?)
        } else {
            None
        };

        self.inner.remove(&id, RemovalReason::Replaced);

        let generation = {
            let mut state = self.inner.state.lock();
            state.next_sequence += 1;
            let sequence = state.next_sequence;

            let mut tasks = Vec::new();
            if let Some(runtime) = &runtime {
                if let Some(timeout_ms) = options.timeout_ms {
                    tasks.push(runtime.spawn(expire_after(
                        Arc::downgrade(&self.inner),
                        id.clone(),
                        sequence,
                        Duration::from_millis(timeout_ms),
                    )));
                }
                if polling {
                    tasks.push(runtime.spawn(poll_condition(
                        Arc::downgrade(&self.inner),
                        id.clone(),
                        sequence,
                        self.inner.config.fallback_interval(),
                    )));
                }
            }

            if !polling {
                for path in &dependencies {
                    let watch = state.paths.entry(path.clone()).or_insert_with(|| PathWatch {
                        _subscription: self.subscribe_path(path),
                        ids: Vec::new(),
                    });
                    watch.ids.push(id.clone());
                }
            }

            state.conditions.insert(
                id.clone(),
                Condition {
                    id: id.clone(),
                    expression: expression.clone(),
                    dependencies: dependencies.clone(),
                    callback,
                    options,
                    polling,
                    created_at: Utc::now(),
                    sequence,
                    generation: sequence,
                    last_value: None,
                    evaluation_count: 0,
                    trigger_count: 0,
                    last_trigger: None,
                    last_write: None,
                    tasks,
                },
            );
            sequence
        };

        tracing::debug!(
            condition = %id,
            expression = %expression,
            dependencies = ?dependencies,
            polling,
            "condition registered"
        );
        self.inner.records.emit(
            LogRecord::new(
                RecordKind::Condition,
                &id,
                format!("condition/{}", id),
                RecordResult::Started,
            )
            .with_meta("expression", expression.as_str())
            .with_meta(
                "dependencies",
                dependencies.iter().cloned().collect::<Vec<_>>(),
            )
            .with_meta("polling", polling),
        );

        self.inner.evaluate(&id, generation, None);

        Ok(WatchHandle {
            id,
            generation,
            watcher: Arc::downgrade(&self.inner),
        })
    }

    fn subscribe_path(&self, path: &str) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        let watched = path.to_string();
        self.inner.store.subscribe(
            path,
            move |change: &StateChange| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_path_change(&watched, change);
                }
            },
            SubscribeOptions::default(),
        )
    }

    /// Remove a condition by id. Returns false if no such condition exists.
    pub fn unwatch_condition(&self, id: &str) -> bool {
        self.inner.remove(id, RemovalReason::Unwatched)
    }

    /// Remove every condition
    pub fn clear(&self) {
        for id in self.watched_ids() {
            self.inner.remove(&id, RemovalReason::Unwatched);
        }
    }

    pub fn condition_stats(&self, id: &str) -> Option<ConditionStats> {
        self.inner.state.lock().conditions.get(id).map(Condition::stats)
    }

    /// Ids of live conditions, sorted
    pub fn watched_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().conditions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct state paths currently subscribed
    pub fn watched_path_count(&self) -> usize {
        self.inner.state.lock().paths.len()
    }

    /// Wait until `expression` is true, at most `timeout`.
    ///
    /// Returns `Ok(false)` on timeout. Evaluation errors count as "not yet true".
    pub async fn wait_for(&self, expression: &str, timeout: Duration) -> Result<bool, WatchError> {
        let id = format!("wait-for/{}", uuid::Uuid::new_v4());
        let (sender, receiver) = oneshot::channel::<()>();
        let sender = Mutex::new(Some(sender));

        let handle = self.watch_condition(
            id,
            expression,
            move |_| {
                if let Some(sender) = sender.lock().take() {
                    let _ = sender.send(());
                }
            },
            WatchOptions::once(),
        )?;

        let satisfied = matches!(tokio::time::timeout(timeout, receiver).await, Ok(Ok(())));
        handle.unwatch();
        Ok(satisfied)
    }
}

impl WatcherInner {
    fn on_path_change(&self, path: &str, change: &StateChange) {
        let mut targets: Vec<(u64, (std::cmp::Reverse<i32>, u64), String)> = {
            let state = self.state.lock();
            let Some(watch) = state.paths.get(path) else {
                return;
            };
            watch
                .ids
                .iter()
                .filter_map(|id| state.conditions.get(id))
                .map(|c| (c.generation, c.order_key(), c.id.clone()))
                .collect()
        };
        targets.sort_by(|a, b| a.1.cmp(&b.1));

        for (generation, _, id) in targets {
            self.evaluate(&id, generation, Some(change));
        }
    }

    /// Evaluate one condition against the current snapshot and fire its callback on a rising edge
    fn evaluate(&self, id: &str, generation: u64, change: Option<&StateChange>) {
        let expression = {
            let mut state = self.state.lock();
            let Some(condition) = state.conditions.get_mut(id) else {
                return;
            };
            if condition.generation != generation {
                return;
            }
            if let Some(change) = change {
                let write = (change.path.clone(), change.version);
                if condition.last_write.as_ref() == Some(&write) {
                    return;
                }
                condition.last_write = Some(write);
            }
            condition.expression.clone()
        };

        let snapshot = self.store.get_snapshot();
        let outcome = self.evaluator.evaluate(&expression, &snapshot);

        let (evaluation, callback) = {
            let mut state = self.state.lock();
            let Some(condition) = state.conditions.get_mut(id) else {
                return;
            };
            if condition.generation != generation {
                return;
            }

            let changed = change.map(|c| (c.path.as_str(), &c.new_value));
            (
                condition.apply(outcome, changed, Instant::now()),
                condition.callback.clone(),
            )
        };

        let (trigger, exhausted) = match evaluation {
            Evaluation::Triggered { trigger, exhausted } => (trigger, exhausted),
            Evaluation::Debounced => {
                tracing::trace!(condition = %id, "trigger suppressed by debounce");
                return;
            }
            Evaluation::Quiet => return,
            Evaluation::Failed(err) => {
                tracing::warn!(condition = %id, error = %err, "condition evaluation failed");
                self.records.emit(
                    LogRecord::new(
                        RecordKind::Condition,
                        id,
                        format!("condition/{}", id),
                        RecordResult::Failure,
                    )
                    .with_message(err.to_string()),
                );
                return;
            }
        };

        // Unregister before the callback so a re-entrant write cannot fire it again
        if exhausted {
            self.remove_generation(id, generation, RemovalReason::MaxTriggers);
        }

        self.records.emit(
            LogRecord::new(
                RecordKind::Condition,
                id,
                format!("condition/{}", id),
                RecordResult::Success,
            )
            .with_meta("trigger_count", trigger.trigger_count)
            .with_meta("result", serde_json::Value::from(trigger.result.clone())),
        );

        callback(&trigger);
    }

    fn remove(&self, id: &str, reason: RemovalReason) -> bool {
        let generation = match self.state.lock().conditions.get(id) {
            Some(condition) => condition.generation,
            None => return false,
        };
        self.remove_generation(id, generation, reason)
    }

    fn remove_generation(&self, id: &str, generation: u64, reason: RemovalReason) -> bool {
        let (condition, released) = {
            let mut state = self.state.lock();
            if state
                .conditions
                .get(id)
                .map_or(true, |c| c.generation != generation)
            {
                return false;
            }
            let Some(condition) = state.conditions.remove(id) else {
                return false;
            };

            let mut released = Vec::new();
            for path in &condition.dependencies {
                let now_empty = match state.paths.get_mut(path) {
                    Some(watch) => {
                        watch.ids.retain(|watched| watched != id);
                        watch.ids.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    released.extend(state.paths.remove(path));
                }
            }
            (condition, released)
        };

        // Store subscriptions and tasks are released outside the watcher lock
        drop(released);

        tracing::debug!(
            condition = %id,
            reason = %reason,
            evaluations = condition.evaluation_count,
            triggers = condition.trigger_count,
            "condition removed"
        );
        self.records.emit(
            LogRecord::new(
                RecordKind::Condition,
                id,
                format!("condition/{}", id),
                RecordResult::Stopped,
            )
            .with_message(reason.to_string()),
        );

        drop(condition);
        true
    }
}

async fn expire_after(inner: Weak<WatcherInner>, id: String, generation: u64, after: Duration) {
    tokio::time::sleep(after).await;
    if let Some(inner) = inner.upgrade() {
        inner.remove_generation(&id, generation, RemovalReason::Timeout);
    }
}

async fn poll_condition(inner: Weak<WatcherInner>, id: String, generation: u64, every: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let alive = inner
            .state
            .lock()
            .conditions
            .get(&id)
            .is_some_and(|c| c.generation == generation);
        if !alive {
            break;
        }
        inner.evaluate(&id, generation, None);
    }
}
