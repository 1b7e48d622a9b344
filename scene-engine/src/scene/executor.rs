// Scene Executor
// Runs scenes through pre-conditions, start event, finish race and post-conditions

use crate::config::SceneExecutorConfig;
use crate::events::{EventBus, LogRecord, RecordKind, RecordResult, RecordSender, RecordSink};
use crate::expression::{Environment, ExpressionEvaluator};
use crate::scene::models::{
    ConditionSpec, Scene, SceneError, SceneExecution, SceneOutcome, ScenePhase, SceneStatus,
};
use crate::state::{StateStore, Value};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Settlement counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneStats {
    /// Settled executions (admission rejections excluded)
    pub total_executed: u64,
    pub successful: u64,
    pub failed: u64,
    pub stopped: u64,
    pub rejected: u64,
    /// Attempts across all executions, retries included
    pub total_attempts: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
}

impl SceneStats {
    fn settle(&mut self, status: SceneStatus, duration: Duration) {
        self.total_executed += 1;
        match status {
            SceneStatus::Completed => self.successful += 1,
            SceneStatus::Stopped => self.stopped += 1,
            _ => self.failed += 1,
        }
        self.total_duration += duration;
        self.average_duration = self.total_duration / self.total_executed as u32;
    }
}

struct ActiveScene {
    execution: SceneExecution,
    stop: watch::Sender<bool>,
}

struct ExecutorInner {
    store: StateStore,
    bus: EventBus,
    evaluator: Arc<dyn ExpressionEvaluator>,
    config: SceneExecutorConfig,
    records: Option<RecordSender>,
    scenes: RwLock<HashMap<String, Arc<Scene>>>,
    active: Mutex<HashMap<Uuid, ActiveScene>>,
    stats: Mutex<SceneStats>,
}

/// Removes an execution from the active table when its future completes or is dropped
struct ActiveGuard {
    inner: Arc<ExecutorInner>,
    id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.lock().remove(&self.id);
    }
}

/// Atomic scene runner with admission control and bounded retry.
///
/// Cloning yields another handle to the same registry and active table.
#[derive(Clone)]
pub struct SceneExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for SceneExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneExecutor")
            .field("scenes", &self.inner.scenes.read().len())
            .field("active", &self.inner.active.lock().len())
            .finish()
    }
}

impl SceneExecutor {
    pub fn new(
        store: StateStore,
        bus: EventBus,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: SceneExecutorConfig,
    ) -> Self {
        Self::with_records(store, bus, evaluator, config, None)
    }

    /// Create an executor that forwards phase and settlement records to a sink
    pub fn with_records(
        store: StateStore,
        bus: EventBus,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: SceneExecutorConfig,
        records: Option<RecordSender>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                bus,
                evaluator,
                config,
                records,
                scenes: RwLock::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                stats: Mutex::new(SceneStats::default()),
            }),
        }
    }

    /// Register (or replace) a scene definition
    pub fn register_scene(&self, scene: Scene) {
        tracing::debug!(scene = %scene.name, "scene registered");
        self.inner
            .scenes
            .write()
            .insert(scene.name.clone(), Arc::new(scene));
    }

    pub fn unregister_scene(&self, name: &str) -> bool {
        self.inner.scenes.write().remove(name).is_some()
    }

    pub fn scene(&self, name: &str) -> Option<Arc<Scene>> {
        self.inner.scenes.read().get(name).cloned()
    }

    pub fn has_scene(&self, name: &str) -> bool {
        self.inner.scenes.read().contains_key(name)
    }

    pub fn scene_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.scenes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Execute a registered scene with the given context
    pub async fn execute_scene(
        &self,
        name: &str,
        context: Environment,
    ) -> Result<SceneOutcome, SceneError> {
        let scene = self
            .scene(name)
            .ok_or_else(|| SceneError::NotFound(name.to_string()))?;

        let (guard, mut stop) = self.admit(&scene, context.clone())?;
        let started = Instant::now();

        let result = self.run_attempts(guard.id, &scene, context, &mut stop).await;
        let duration = started.elapsed();

        let status = match &result {
            Ok(_) => SceneStatus::Completed,
            Err((SceneError::Stopped(_), _)) => SceneStatus::Stopped,
            Err(_) => SceneStatus::Failed,
        };
        let attempts = match &result {
            Ok((_, attempts)) | Err((_, attempts)) => *attempts,
        };

        if let Some(active) = self.inner.active.lock().get_mut(&guard.id) {
            active.execution.status = status;
            active.execution.end_time = Some(Utc::now());
        }
        self.inner.stats.lock().settle(status, duration);

        let mut record = LogRecord::new(
            RecordKind::Scene,
            &scene.name,
            format!("scene/{}", scene.name),
            match status {
                SceneStatus::Completed => RecordResult::Success,
                SceneStatus::Stopped => RecordResult::Stopped,
                _ => RecordResult::Failure,
            },
        )
        .with_duration(duration)
        .with_meta("execution_id", guard.id.to_string())
        .with_meta("attempts", attempts);
        if let Err((err, _)) = &result {
            record = record
                .with_message(err.to_string())
                .with_meta("error_kind", err.kind());
        }
        self.inner.records.emit(record);

        let execution_id = guard.id;
        drop(guard);

        result
            .map(|(context, attempts)| SceneOutcome {
                execution_id,
                scene: scene.name.clone(),
                duration,
                attempts,
                context,
            })
            .map_err(|(err, _)| err)
    }

    /// Reserve a slot in the active table or reject
    fn admit(
        &self,
        scene: &Arc<Scene>,
        context: Environment,
    ) -> Result<(ActiveGuard, watch::Receiver<bool>), SceneError> {
        let limit = self.inner.config.max_concurrent_scenes;
        let mut active = self.inner.active.lock();

        if active.len() >= limit {
            let count = active.len();
            drop(active);
            self.inner.stats.lock().rejected += 1;

            let err = SceneError::AdmissionRejected {
                scene: scene.name.clone(),
                active: count,
                limit,
            };
            self.inner.records.emit(
                LogRecord::new(
                    RecordKind::Scene,
                    &scene.name,
                    format!("scene/{}", scene.name),
                    RecordResult::Failure,
                )
                .with_message(err.to_string())
                .with_meta("error_kind", err.kind()),
            );
            return Err(err);
        }

        let execution = SceneExecution::new(scene.clone(), context);
        let id = execution.execution_id;
        let (stop, stop_rx) = watch::channel(false);
        active.insert(id, ActiveScene { execution, stop });

        Ok((
            ActiveGuard {
                inner: self.inner.clone(),
                id,
            },
            stop_rx,
        ))
    }

    /// Bounded retry loop; returns the final context or error plus the attempt count
    async fn run_attempts(
        &self,
        id: Uuid,
        scene: &Scene,
        context: Environment,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(Environment, u32), (SceneError, u32)> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.inner.stats.lock().total_attempts += 1;
            self.update(id, |execution| {
                execution.retry_count = attempt - 1;
                execution.phase = ScenePhase::Started;
            });

            let attempt_start = Instant::now();
            let err = match self
                .run_attempt(id, scene, attempt, attempt_start, context.clone(), stop)
                .await
            {
                Ok(context) => return Ok((context, attempt)),
                Err(err) => err,
            };

            self.update(id, |execution| {
                execution.phase = ScenePhase::Failed;
                execution.errors.push(err.to_string());
            });
            self.inner.records.emit(
                self.phase_record(
                    scene,
                    ScenePhase::Failed,
                    attempt,
                    attempt_start,
                    RecordResult::Failure,
                )
                .with_message(err.to_string()),
            );

            if !err.is_retryable() || attempt > scene.max_retries {
                return Err((err, attempt));
            }

            tracing::warn!(
                scene = %scene.name,
                attempt,
                max_retries = scene.max_retries,
                error = %err,
                "scene attempt failed, retrying"
            );
            self.update(id, |execution| {
                execution
                    .warnings
                    .push(format!("attempt {} failed: {}", attempt, err));
            });

            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.retry_delay()) => {}
                _ = stopped(stop) => {
                    return Err((SceneError::Stopped(scene.name.clone()), attempt));
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        id: Uuid,
        scene: &Scene,
        attempt: u32,
        started: Instant,
        mut context: Environment,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Environment, SceneError> {
        self.enter_phase(id, scene, ScenePhase::Started, attempt, started, stop)?;

        self.enter_phase(id, scene, ScenePhase::PreConditions, attempt, started, stop)?;
        self.check_conditions(scene, ScenePhase::PreConditions, &scene.pre_conditions, &context)?;

        // Listen before publishing so an immediate reply is not missed
        let listener = scene
            .finish_event
            .as_ref()
            .map(|event| self.inner.bus.subscribe_once(event.as_str()));

        self.enter_phase(id, scene, ScenePhase::StartEvent, attempt, started, stop)?;
        if let Some(event) = &scene.start_event {
            let payload = Value::Object(context.clone());
            self.inner.bus.publish(event.as_str(), payload);
        }

        self.enter_phase(id, scene, ScenePhase::WaitingFinish, attempt, started, stop)?;
        if let (Some(listener), Some(event)) = (listener, &scene.finish_event) {
            let timeout_ms = scene
                .timeout_ms
                .unwrap_or(self.inner.config.default_timeout_ms);

            // The losing branch is dropped here: a pending listener deregisters, a timer is cancelled
            tokio::select! {
                received = listener => match received {
                    Ok(finish) => {
                        context.insert(format!("event.{}", event), finish.payload);
                    }
                    Err(_) => return Err(SceneError::Stopped(scene.name.clone())),
                },
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    return Err(SceneError::SceneTimeout {
                        scene: scene.name.clone(),
                        event: event.clone(),
                        timeout_ms,
                    });
                }
                _ = stopped(stop) => return Err(SceneError::Stopped(scene.name.clone())),
            }
        }

        self.enter_phase(id, scene, ScenePhase::PostConditions, attempt, started, stop)?;
        self.check_conditions(scene, ScenePhase::PostConditions, &scene.post_conditions, &context)?;

        self.update(id, |execution| {
            execution.phase = ScenePhase::Completed;
            execution.context = context.clone();
        });
        self.inner.records.emit(self.phase_record(
            scene,
            ScenePhase::Completed,
            attempt,
            started,
            RecordResult::Success,
        ));

        Ok(context)
    }

    fn enter_phase(
        &self,
        id: Uuid,
        scene: &Scene,
        phase: ScenePhase,
        attempt: u32,
        started: Instant,
        stop: &watch::Receiver<bool>,
    ) -> Result<(), SceneError> {
        if *stop.borrow() {
            return Err(SceneError::Stopped(scene.name.clone()));
        }
        self.update(id, |execution| execution.phase = phase);
        self.inner
            .records
            .emit(self.phase_record(scene, phase, attempt, started, RecordResult::Started));
        Ok(())
    }

    /// Evaluate guards fail-fast against state overlaid with the context
    fn check_conditions(
        &self,
        scene: &Scene,
        phase: ScenePhase,
        conditions: &[ConditionSpec],
        context: &Environment,
    ) -> Result<(), SceneError> {
        if conditions.is_empty() {
            return Ok(());
        }

        let mut environment = self.inner.store.get_snapshot();
        environment.extend(context.iter().map(|(k, v)| (k.clone(), v.clone())));

        for condition in conditions {
            let outcome = match condition {
                ConditionSpec::Predicate { predicate, .. } => Ok(predicate(&environment)),
                ConditionSpec::Expression(expression)
                | ConditionSpec::Described { expression, .. } => self
                    .inner
                    .evaluator
                    .evaluate_bool(expression, &environment)
                    .map_err(|err| err.to_string()),
            };

            let reason = match outcome {
                Ok(true) => continue,
                Ok(false) => "evaluated to false".to_string(),
                Err(message) => message,
            };

            let scene_name = scene.name.clone();
            let condition = condition.label().to_string();
            return Err(if phase == ScenePhase::PreConditions {
                SceneError::PreConditionFailed {
                    scene: scene_name,
                    condition,
                    reason,
                }
            } else {
                SceneError::PostConditionFailed {
                    scene: scene_name,
                    condition,
                    reason,
                }
            });
        }

        Ok(())
    }

    fn phase_record(
        &self,
        scene: &Scene,
        phase: ScenePhase,
        attempt: u32,
        started: Instant,
        result: RecordResult,
    ) -> LogRecord {
        // Duration is measured from the start of the attempt
        LogRecord::new(
            RecordKind::Phase,
            &scene.name,
            format!("scene/{}/{}", scene.name, phase),
            result,
        )
        .with_duration(started.elapsed())
        .with_meta("phase", phase.as_str())
        .with_meta("attempt", attempt)
    }

    fn update<F>(&self, id: Uuid, f: F)
    where
        F: FnOnce(&mut SceneExecution),
    {
        if let Some(active) = self.inner.active.lock().get_mut(&id) {
            f(&mut active.execution);
        }
    }

    /// Number of scenes currently admitted
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Snapshot of every active execution record
    pub fn active_executions(&self) -> Vec<SceneExecution> {
        self.inner
            .active
            .lock()
            .values()
            .map(|active| active.execution.clone())
            .collect()
    }

    /// Signal every active scene to stop and clear the active table.
    ///
    /// Running attempts observe the signal at their next phase boundary,
    /// finish race or retry delay. Returns the number of scenes signalled.
    pub fn stop_all_scenes(&self) -> usize {
        let stopped: Vec<ActiveScene> = self.inner.active.lock().drain().map(|(_, a)| a).collect();

        for active in &stopped {
            let _ = active.stop.send(true);
        }

        if !stopped.is_empty() {
            tracing::info!(count = stopped.len(), "stopped all active scenes");
        }
        stopped.len()
    }

    pub fn stats(&self) -> SceneStats {
        self.inner.stats.lock().clone()
    }
}

/// Resolves once the stop flag is raised; pends forever if the sender is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}
