// Execution Controller
// Orchestrates scenario executions across the four dispatch modes

use crate::config::ControllerConfig;
use crate::events::{LogRecord, RecordKind, RecordResult, RecordSender, RecordSink};
use crate::expression::{Environment, ExpressionEvaluator};
use crate::orchestrator::analytics::{ConcurrencyGauge, RunAnalytics};
use crate::orchestrator::graph::DependencyGraph;
use crate::orchestrator::models::{
    ExecutionMode, ExecutionOptions, OrchestrationError, RunReport, ScenarioExecution,
    ScenarioUnit, UnitResult, UnitStatus, UnitTarget,
};
use crate::orchestrator::simulation::{
    Checkpoint, SimulationClock, SimulationState, SimulationStatus,
};
use crate::reactive::ReactiveConditionWatcher;
use crate::scene::{ConditionSpec, Scenario, ScenarioExecutor, Scene, SceneError};
use crate::system::System;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Runs the body of one unit
#[async_trait::async_trait]
pub trait UnitRunner: Send + Sync {
    async fn run_unit(&self, unit: &ScenarioUnit, context: Environment) -> Result<(), SceneError>;

    /// Ask everything this runner has in flight to stop; returns how many were signalled
    fn stop_all(&self) -> usize {
        0
    }
}

/// Runs units against registered scenes and scenarios
#[derive(Debug, Clone)]
pub struct SceneUnitRunner {
    scenarios: ScenarioExecutor,
}

impl SceneUnitRunner {
    pub fn new(scenarios: ScenarioExecutor) -> Self {
        Self { scenarios }
    }
}

#[async_trait::async_trait]
impl UnitRunner for SceneUnitRunner {
    async fn run_unit(&self, unit: &ScenarioUnit, context: Environment) -> Result<(), SceneError> {
        match &unit.target {
            UnitTarget::Scene(scene) => self
                .scenarios
                .scene_executor()
                .execute_scene(scene, context)
                .await
                .map(|_| ()),
            UnitTarget::Scenario(name) => {
                let scenario = self
                    .scenarios
                    .scenario(name)
                    .ok_or_else(|| SceneError::NotFound(name.clone()))?;
                let outcome = self.scenarios.execute_scenario(&scenario, context).await?;
                match outcome.failures.into_iter().next() {
                    Some((_, err)) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    fn stop_all(&self) -> usize {
        self.scenarios.scene_executor().stop_all_scenes()
    }
}

/// Effective settings of one run after applying [`ExecutionOptions`]
struct RunSettings {
    continue_on_error: bool,
    max_concurrent: usize,
}

/// Ends a run on the simulation clock when dropped, including on cancellation
struct ActiveRun<'a> {
    controller: &'a ExecutionController,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.controller.clock.end_run() {
            self.controller.transport_record("stop", previous);
        }
    }
}

/// Everything a spawned unit needs, owned
#[derive(Clone)]
struct Dispatcher {
    execution: String,
    runner: Arc<dyn UnitRunner>,
    records: Option<RecordSender>,
    gauge: Arc<ConcurrencyGauge>,
    run_gauge: Arc<ConcurrencyGauge>,
    context: Environment,
}

impl Dispatcher {
    async fn run(self, unit: ScenarioUnit) -> UnitResult {
        let mut context = self.context;
        context.extend(unit.context.iter().map(|(k, v)| (k.clone(), v.clone())));

        let _in_flight = (self.gauge.enter(), self.run_gauge.enter());
        let started = Instant::now();
        tracing::debug!(
            execution = %self.execution,
            unit = %unit.name,
            target = %unit.target.name(),
            "unit dispatched"
        );

        let outcome = self.runner.run_unit(&unit, context).await;
        let duration = started.elapsed();

        let (status, error) = match outcome {
            Ok(()) => (UnitStatus::Completed, None),
            Err(err @ SceneError::Stopped(_)) => (UnitStatus::Stopped, Some(err)),
            Err(err) => (UnitStatus::Failed, Some(err)),
        };

        let mut record = LogRecord::new(
            RecordKind::Unit,
            &unit.name,
            format!("execution/{}/{}", self.execution, unit.name),
            match status {
                UnitStatus::Completed => RecordResult::Success,
                UnitStatus::Stopped => RecordResult::Stopped,
                _ => RecordResult::Failure,
            },
        )
        .with_duration(duration)
        .with_meta("target", unit.target.name());
        if let Some(err) = &error {
            record = record.with_message(err.to_string());
        }
        self.records.emit(record);

        UnitResult {
            name: unit.name,
            status,
            duration,
            error,
            reason: None,
        }
    }
}

/// Scenario execution orchestrator with simulation transport controls
#[derive(Clone)]
pub struct ExecutionController {
    runner: Arc<dyn UnitRunner>,
    scenarios: ScenarioExecutor,
    watcher: ReactiveConditionWatcher,
    evaluator: Arc<dyn ExpressionEvaluator>,
    config: ControllerConfig,
    clock: SimulationClock,
    gauge: Arc<ConcurrencyGauge>,
    records: Option<RecordSender>,
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionController")
            .field("config", &self.config)
            .field("simulation", &self.clock.state())
            .field("in_flight", &self.gauge.current())
            .finish()
    }
}

impl ExecutionController {
    pub fn new(system: &System) -> Self {
        let runner = Arc::new(SceneUnitRunner::new(system.scenarios().clone()));
        Self::with_runner(system, runner)
    }

    /// Controller with a custom unit body
    pub fn with_runner(system: &System, runner: Arc<dyn UnitRunner>) -> Self {
        Self {
            runner,
            scenarios: system.scenarios().clone(),
            watcher: system.watcher().clone(),
            evaluator: Arc::clone(system.evaluator()),
            config: system.config().controller.clone(),
            clock: SimulationClock::new(),
            gauge: Arc::new(ConcurrencyGauge::new()),
            records: system.records().cloned(),
        }
    }

    pub fn register_scene(&self, scene: Scene) {
        self.scenarios.scene_executor().register_scene(scene);
    }

    pub fn register_scenario(&self, scenario: Scenario) {
        self.scenarios.register_scenario(scenario);
    }

    /// Units currently running across all runs of this controller
    pub fn in_flight(&self) -> usize {
        self.gauge.current()
    }

    pub fn simulation_state(&self) -> SimulationState {
        self.clock.state()
    }

    pub fn play(&self) {
        let previous = self.clock.play();
        self.transport_record("play", previous);
    }

    pub fn pause(&self) {
        let previous = self.clock.pause();
        self.transport_record("pause", previous);
    }

    /// Let exactly one more unit dispatch, then pause
    pub fn step(&self) {
        let previous = self.clock.step();
        self.transport_record("step", previous);
    }

    /// Stop the simulation. Running runs abort at their next checkpoint and
    /// active scenes are signalled to stop. Returns the number of scenes signalled.
    pub fn stop(&self) -> usize {
        let previous = self.clock.stop();
        let stopped = self.runner.stop_all();
        self.transport_record("stop", previous);
        stopped
    }

    pub fn set_speed(&self, speed: f64) -> Result<(), OrchestrationError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(OrchestrationError::InvalidSpeed(speed));
        }
        self.clock.set_speed(speed);
        self.records.emit(
            LogRecord::new(
                RecordKind::Simulation,
                "speed",
                "simulation/speed",
                RecordResult::Info,
            )
            .with_meta("speed", speed),
        );
        Ok(())
    }

    fn transport_record(&self, action: &str, previous: SimulationStatus) {
        let state = self.clock.state();
        self.records.emit(
            LogRecord::new(
                RecordKind::Simulation,
                action,
                format!("simulation/{action}"),
                RecordResult::Info,
            )
            .with_message(format!("{previous} -> {}", state.status))
            .with_meta("current_step", state.current_step),
        );
    }

    /// Run a scenario execution to completion.
    ///
    /// Unit failures abort the run with [`OrchestrationError::UnitFailed`]
    /// unless `continue_on_error` is set, in which case they are reported in
    /// the [`RunReport`] and `success` is false.
    pub async fn execute_scenario_execution(
        &self,
        execution: &ScenarioExecution,
        options: ExecutionOptions,
    ) -> Result<RunReport, OrchestrationError> {
        let started = Instant::now();
        let graph = DependencyGraph::build(execution)?;

        let settings = RunSettings {
            continue_on_error: options
                .continue_on_error
                .unwrap_or(execution.continue_on_error),
            max_concurrent: options
                .max_concurrent_scenarios
                .or(execution.max_concurrent_scenarios)
                .unwrap_or(self.config.max_concurrent_scenarios)
                .clamp(1, execution.units.len().max(1)),
        };
        let timeout_ms = options.timeout_ms.or(execution.timeout_ms);
        let run_gauge = Arc::new(ConcurrencyGauge::new());
        let dispatcher = Dispatcher {
            execution: execution.name.clone(),
            runner: Arc::clone(&self.runner),
            records: self.records.clone(),
            gauge: Arc::clone(&self.gauge),
            run_gauge: Arc::clone(&run_gauge),
            context: options.context,
        };

        if self.clock.begin_run(execution.units.len()) {
            self.transport_record("play", SimulationStatus::Stopped);
        }
        let _run = ActiveRun { controller: self };

        tracing::info!(
            execution = %execution.name,
            mode = ?execution.execution_mode,
            units = execution.units.len(),
            "scenario execution started"
        );
        self.records.emit(
            LogRecord::new(
                RecordKind::Execution,
                &execution.name,
                format!("execution/{}", execution.name),
                RecordResult::Started,
            )
            .with_meta("mode", format!("{:?}", execution.execution_mode).to_lowercase())
            .with_meta("units", execution.units.len()),
        );

        let dispatch = self.dispatch(execution, &graph, &settings, &dispatcher);
        let outcome = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), dispatch).await {
                Ok(outcome) => outcome,
                Err(_) => Err(OrchestrationError::RunTimeout {
                    execution: execution.name.clone(),
                    timeout_ms: ms,
                }),
            },
            None => dispatch.await,
        };
        let duration = started.elapsed();

        let results = match outcome {
            Ok(results) => results,
            Err(err) => {
                self.records.emit(
                    LogRecord::new(
                        RecordKind::Execution,
                        &execution.name,
                        format!("execution/{}", execution.name),
                        if err == OrchestrationError::Stopped {
                            RecordResult::Stopped
                        } else {
                            RecordResult::Failure
                        },
                    )
                    .with_duration(duration)
                    .with_message(err.to_string()),
                );
                return Err(err);
            }
        };

        let analytics = RunAnalytics::from_results(&results, run_gauge.peak());
        let success = !results.iter().any(UnitResult::is_failure);

        self.records.emit(
            LogRecord::new(
                RecordKind::Execution,
                &execution.name,
                format!("execution/{}", execution.name),
                if success {
                    RecordResult::Success
                } else {
                    RecordResult::Failure
                },
            )
            .with_duration(duration)
            .with_meta("successful", analytics.successful)
            .with_meta("failed", analytics.failed)
            .with_meta("skipped", analytics.skipped)
            .with_meta("peak_concurrency", analytics.peak_concurrency),
        );

        Ok(RunReport {
            name: execution.name.clone(),
            success,
            results,
            duration,
            analytics,
        })
    }

    async fn dispatch(
        &self,
        execution: &ScenarioExecution,
        graph: &DependencyGraph,
        settings: &RunSettings,
        dispatcher: &Dispatcher,
    ) -> Result<Vec<UnitResult>, OrchestrationError> {
        match execution.execution_mode {
            ExecutionMode::Sequential => {
                self.run_sequential(execution, graph, settings, dispatcher, false)
                    .await
            }
            ExecutionMode::Conditional => {
                self.run_sequential(execution, graph, settings, dispatcher, true)
                    .await
            }
            ExecutionMode::Parallel => {
                self.run_parallel(execution, graph, settings, dispatcher)
                    .await
            }
            ExecutionMode::Dependency => {
                self.run_dependency(execution, graph, settings, dispatcher)
                    .await
            }
        }
    }

    /// One unit at a time in topological order. In conditional mode units
    /// whose pre-conditions do not become true in time are skipped.
    async fn run_sequential(
        &self,
        execution: &ScenarioExecution,
        graph: &DependencyGraph,
        settings: &RunSettings,
        dispatcher: &Dispatcher,
        conditional: bool,
    ) -> Result<Vec<UnitResult>, OrchestrationError> {
        let order = graph.topological_order()?;
        let mut results = Vec::with_capacity(order.len());
        let mut incomplete = HashSet::new();

        for name in order {
            let Some(unit) = execution.unit(&name) else {
                continue;
            };
            self.checkpoint().await?;

            if let Some(dep) = failed_dependency(graph, &name, &incomplete) {
                results.push(self.skip(dispatcher, &name, format!("dependency '{dep}' did not complete")));
                incomplete.insert(name);
                continue;
            }

            if conditional {
                if let Some(reason) = self.unmet_pre_condition(unit, &dispatcher.context).await {
                    results.push(self.skip(dispatcher, &name, reason));
                    incomplete.insert(name);
                    continue;
                }
            }

            let result = dispatcher.clone().run(unit.clone()).await;
            if result.is_failure() {
                if !settings.continue_on_error {
                    return Err(unit_error(&result));
                }
                incomplete.insert(name);
            }
            results.push(result);
        }

        Ok(results)
    }

    /// Consecutive chunks of at most `max_concurrent` units; each chunk settles
    /// completely before the next one is dispatched.
    async fn run_parallel(
        &self,
        execution: &ScenarioExecution,
        graph: &DependencyGraph,
        settings: &RunSettings,
        dispatcher: &Dispatcher,
    ) -> Result<Vec<UnitResult>, OrchestrationError> {
        let order = graph.topological_order()?;
        let mut results = Vec::with_capacity(order.len());
        let mut incomplete = HashSet::new();

        for chunk in order.chunks(settings.max_concurrent) {
            let mut handles = Vec::with_capacity(chunk.len());

            for name in chunk {
                let Some(unit) = execution.unit(name) else {
                    continue;
                };
                self.checkpoint().await?;

                if let Some(dep) = failed_dependency(graph, name, &incomplete) {
                    results.push(self.skip(dispatcher, name, format!("dependency '{dep}' did not complete")));
                    incomplete.insert(name.clone());
                    continue;
                }

                let task = dispatcher.clone();
                let unit = unit.clone();
                handles.push((name.clone(), tokio::spawn(task.run(unit))));
            }

            let settled = settle(handles).await;
            let first_failure = settled.iter().find(|r| r.is_failure()).map(unit_error);
            for result in &settled {
                if result.is_failure() {
                    incomplete.insert(result.name.clone());
                }
            }
            results.extend(settled);

            if let Some(err) = first_failure {
                if !settings.continue_on_error {
                    return Err(err);
                }
            }
        }

        Ok(results)
    }

    /// Ready-set scheduling: dispatch every unit whose dependencies completed,
    /// wait for the set to settle, repeat. A round with nothing ready while
    /// units remain outstanding is a deadlock.
    async fn run_dependency(
        &self,
        execution: &ScenarioExecution,
        graph: &DependencyGraph,
        settings: &RunSettings,
        dispatcher: &Dispatcher,
    ) -> Result<Vec<UnitResult>, OrchestrationError> {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent));
        let mut results = Vec::with_capacity(graph.len());
        let mut completed: HashSet<String> = HashSet::new();
        let mut settled: HashSet<String> = HashSet::new();

        while settled.len() < graph.len() {
            if settings.continue_on_error {
                self.skip_blocked(graph, dispatcher, &completed, &mut settled, &mut results);
                if settled.len() == graph.len() {
                    break;
                }
            }

            let ready = graph.ready_set(&completed, &settled);
            if ready.is_empty() {
                let pending = graph
                    .names()
                    .iter()
                    .filter(|name| !settled.contains(*name))
                    .cloned()
                    .collect();
                return Err(OrchestrationError::DependencyDeadlock { pending });
            }

            let mut handles = Vec::with_capacity(ready.len());
            for name in ready {
                let Some(unit) = execution.unit(&name) else {
                    settled.insert(name);
                    continue;
                };
                self.checkpoint().await?;

                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| OrchestrationError::Stopped)?;
                let task = dispatcher.clone();
                let unit = unit.clone();
                handles.push((
                    name,
                    tokio::spawn(async move {
                        let _permit = permit;
                        task.run(unit).await
                    }),
                ));
            }

            let round = settle(handles).await;
            let first_failure = round.iter().find(|r| r.is_failure()).map(unit_error);
            for result in &round {
                settled.insert(result.name.clone());
                if result.status == UnitStatus::Completed {
                    completed.insert(result.name.clone());
                }
            }
            results.extend(round);

            if let Some(err) = first_failure {
                if !settings.continue_on_error {
                    return Err(err);
                }
            }
        }

        Ok(results)
    }

    /// Settle, as skipped, every unit that can no longer run because a
    /// dependency settled without completing
    fn skip_blocked(
        &self,
        graph: &DependencyGraph,
        dispatcher: &Dispatcher,
        completed: &HashSet<String>,
        settled: &mut HashSet<String>,
        results: &mut Vec<UnitResult>,
    ) {
        loop {
            let blocked: Vec<(String, String)> = graph
                .names()
                .iter()
                .filter(|name| !settled.contains(*name))
                .filter_map(|name| {
                    graph
                        .dependencies(name)
                        .iter()
                        .find(|dep| settled.contains(*dep) && !completed.contains(*dep))
                        .map(|dep| (name.clone(), dep.clone()))
                })
                .collect();

            if blocked.is_empty() {
                return;
            }
            for (name, dep) in blocked {
                results.push(self.skip(dispatcher, &name, format!("dependency '{dep}' failed")));
                settled.insert(name);
            }
        }
    }

    async fn checkpoint(&self) -> Result<(), OrchestrationError> {
        match self
            .clock
            .checkpoint(
                self.config.pause_poll_interval(),
                self.config.base_step_delay(),
            )
            .await
        {
            Checkpoint::Proceed(_) => Ok(()),
            Checkpoint::Stopped => Err(OrchestrationError::Stopped),
        }
    }

    /// First pre-condition of `unit` that does not hold within the condition wait.
    ///
    /// Conditions see the store overlaid with the run context, then the unit
    /// context. An expression that does not hold immediately is watched on the
    /// store until the wait elapses.
    async fn unmet_pre_condition(&self, unit: &ScenarioUnit, context: &Environment) -> Option<String> {
        if unit.pre_conditions.is_empty() {
            return None;
        }
        let mut environment = self.watcher.store().get_snapshot();
        environment.extend(context.iter().map(|(k, v)| (k.clone(), v.clone())));
        environment.extend(unit.context.iter().map(|(k, v)| (k.clone(), v.clone())));

        for condition in &unit.pre_conditions {
            let met = match condition {
                ConditionSpec::Predicate { predicate, .. } => predicate(&environment),
                ConditionSpec::Expression(expression)
                | ConditionSpec::Described { expression, .. } => {
                    if matches!(self.evaluator.evaluate_bool(expression, &environment), Ok(true)) {
                        continue;
                    }
                    match self
                        .watcher
                        .wait_for(expression, self.config.condition_wait())
                        .await
                    {
                        Ok(met) => met,
                        Err(err) => {
                            tracing::warn!(unit = %unit.name, error = %err, "pre-condition could not be watched");
                            false
                        }
                    }
                }
            };

            if !met {
                return Some(format!("pre-condition '{}' not met", condition.label()));
            }
        }
        None
    }

    fn skip(&self, dispatcher: &Dispatcher, unit: &str, reason: String) -> UnitResult {
        tracing::info!(execution = %dispatcher.execution, unit = %unit, reason = %reason, "unit skipped");
        self.records.emit(
            LogRecord::new(
                RecordKind::Unit,
                unit,
                format!("execution/{}/{}", dispatcher.execution, unit),
                RecordResult::Skipped,
            )
            .with_message(reason.clone()),
        );
        UnitResult::skipped(unit, reason)
    }
}

/// Await every handle; a task that panicked settles as failed
async fn settle(handles: Vec<(String, JoinHandle<UnitResult>)>) -> Vec<UnitResult> {
    let mut results = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(err) => {
                tracing::error!(unit = %name, error = %err, "unit task failed");
                results.push(UnitResult {
                    name,
                    status: UnitStatus::Failed,
                    duration: Duration::ZERO,
                    error: None,
                    reason: Some(err.to_string()),
                });
            }
        }
    }
    results
}

fn failed_dependency<'a>(
    graph: &'a DependencyGraph,
    unit: &str,
    incomplete: &HashSet<String>,
) -> Option<&'a String> {
    graph
        .dependencies(unit)
        .iter()
        .find(|dep| incomplete.contains(*dep))
}

fn unit_error(result: &UnitResult) -> OrchestrationError {
    match &result.error {
        Some(SceneError::Stopped(_)) => OrchestrationError::Stopped,
        Some(err) => OrchestrationError::UnitFailed {
            unit: result.name.clone(),
            source: err.clone(),
        },
        None => OrchestrationError::UnitAborted {
            unit: result.name.clone(),
            message: result.reason.clone().unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::state::Value;
    use parking_lot::Mutex;

    /// Sleeps for the unit's `ms` context value; fails units named `fail*`
    #[derive(Default)]
    struct FakeRunner {
        started: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl UnitRunner for FakeRunner {
        async fn run_unit(&self, unit: &ScenarioUnit, context: Environment) -> Result<(), SceneError> {
            self.started.lock().push(unit.name.clone());
            let ms = context.get("ms").and_then(|v| v.as_number()).unwrap_or(0.0);
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            if unit.name.starts_with("fail") {
                return Err(SceneError::PreConditionFailed {
                    scene: unit.name.clone(),
                    condition: "ok".to_string(),
                    reason: "false".to_string(),
                });
            }
            Ok(())
        }
    }

    fn controller() -> (ExecutionController, Arc<FakeRunner>, System) {
        let system = System::new(EngineConfig::default());
        let runner = Arc::new(FakeRunner::default());
        let controller = ExecutionController::with_runner(&system, runner.clone());
        (controller, runner, system)
    }

    fn unit(name: &str, ms: u64) -> ScenarioUnit {
        ScenarioUnit::scene(name, name).with_context("ms", ms as f64)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_order() {
        let (controller, runner, _system) = controller();
        let execution = ScenarioExecution::new("seq", ExecutionMode::Sequential)
            .with_unit(unit("a", 10))
            .with_unit(unit("b", 10))
            .with_unit(unit("c", 10));

        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(*runner.started.lock(), vec!["a", "b", "c"]);
        assert_eq!(report.analytics.peak_concurrency, 1);
        assert_eq!(report.analytics.successful, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_aborts_on_failure() {
        let (controller, runner, _system) = controller();
        let execution = ScenarioExecution::new("seq", ExecutionMode::Sequential)
            .with_unit(unit("a", 0))
            .with_unit(unit("fail_b", 0))
            .with_unit(unit("c", 0));

        let err = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::UnitFailed { ref unit, .. } if unit == "fail_b"));
        assert_eq!(*runner.started.lock(), vec!["a", "fail_b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_on_error_reports_failure() {
        let (controller, runner, _system) = controller();
        let execution = ScenarioExecution::new("seq", ExecutionMode::Sequential)
            .with_unit(unit("fail_a", 0))
            .with_unit(unit("b", 0).depends_on("fail_a"))
            .with_unit(unit("c", 0))
            .with_continue_on_error(true);

        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.result("fail_a").unwrap().status, UnitStatus::Failed);
        assert_eq!(report.result("b").unwrap().status, UnitStatus::Skipped);
        assert_eq!(report.result("c").unwrap().status, UnitStatus::Completed);
        assert_eq!(*runner.started.lock(), vec!["fail_a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_chunks_with_barrier() {
        let (controller, _runner, _system) = controller();
        let execution = ScenarioExecution::new("par", ExecutionMode::Parallel)
            .with_unit(unit("a", 100))
            .with_unit(unit("b", 300))
            .with_unit(unit("c", 100))
            .with_max_concurrent(2);

        let started = Instant::now();
        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();

        // Chunk [a, b] waits for b (300ms), then c runs alone
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(report.analytics.peak_concurrency, 2);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_is_fatal_in_sequential_mode() {
        let (controller, runner, _system) = controller();
        let execution = ScenarioExecution::new("cyc", ExecutionMode::Sequential)
            .with_unit(unit("a", 0).depends_on("b"))
            .with_unit(unit("b", 0).depends_on("a"));

        let err = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::CircularDependency(_)));
        assert!(runner.started.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_mode_order() {
        let (controller, runner, _system) = controller();
        let execution = ScenarioExecution::new("dep", ExecutionMode::Dependency)
            .with_unit(unit("deploy", 10))
            .with_unit(unit("build", 10))
            .with_unit(unit("test", 10))
            .with_dependency("deploy", "test")
            .with_dependency("test", "build");

        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(*runner.started.lock(), vec!["build", "test", "deploy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_mode_skips_dependents_of_failure() {
        let (controller, _runner, _system) = controller();
        let execution = ScenarioExecution::new("dep", ExecutionMode::Dependency)
            .with_unit(unit("fail_build", 0))
            .with_unit(unit("test", 0).depends_on("fail_build"))
            .with_unit(unit("deploy", 0).depends_on("test"))
            .with_unit(unit("docs", 0))
            .with_continue_on_error(true);

        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.result("test").unwrap().status, UnitStatus::Skipped);
        assert_eq!(report.result("deploy").unwrap().status, UnitStatus::Skipped);
        assert_eq!(report.result("docs").unwrap().status, UnitStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_mode_bounds_concurrency() {
        let (controller, runner, _system) = controller();
        let mut execution =
            ScenarioExecution::new("dep", ExecutionMode::Dependency).with_max_concurrent(2);
        for i in 0..5 {
            execution = execution.with_unit(unit(&format!("unit-{i}"), 100));
        }

        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sampler = {
            let controller = controller.clone();
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                loop {
                    peak.fetch_max(controller.in_flight(), std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();
        sampler.abort();

        assert!(report.success);
        assert_eq!(runner.started.lock().len(), 5);
        assert_eq!(report.analytics.peak_concurrency, 2);
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_concurrency_is_clamped() {
        let (controller, runner, _system) = controller();
        let execution = ScenarioExecution::new("dep", ExecutionMode::Dependency)
            .with_unit(unit("a", 10))
            .with_unit(unit("b", 10))
            .with_unit(unit("c", 10).depends_on("a"))
            .with_max_concurrent(usize::MAX);

        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.analytics.peak_concurrency, 2);
        assert_eq!(runner.started.lock().len(), 3);

        let options = ExecutionOptions {
            max_concurrent_scenarios: Some(usize::MAX),
            ..Default::default()
        };
        let parallel = ScenarioExecution::new("par", ExecutionMode::Parallel)
            .with_unit(unit("d", 10))
            .with_unit(unit("e", 10));
        let report = controller
            .execute_scenario_execution(&parallel, options)
            .await
            .unwrap();
        assert_eq!(report.analytics.peak_concurrency, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conditional_skips_unmet_units() {
        let (controller, runner, system) = controller();
        system.store().set_value("dock.free", true);
        let execution = ScenarioExecution::new("cond", ExecutionMode::Conditional)
            .with_unit(unit("dock", 0).with_pre_condition("dock.free == true"))
            .with_unit(unit("charge", 0).with_pre_condition("charger.free == true"))
            .with_unit(unit("leave", 0));

        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.result("charge").unwrap().status, UnitStatus::Skipped);
        assert_eq!(*runner.started.lock(), vec!["dock", "leave"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conditional_sees_run_and_unit_context() {
        let (controller, runner, system) = controller();
        system.store().set_value("zone", "a");
        let execution = ScenarioExecution::new("cond", ExecutionMode::Conditional)
            .with_unit(
                unit("enter", 0)
                    .with_context("zone", "b")
                    .with_pre_condition("zone == 'b'"),
            )
            .with_unit(unit("shift", 0).with_pre_condition("shift == 'night'"))
            .with_unit(unit("stay", 0).with_pre_condition("zone == 'c'"));
        let options = ExecutionOptions {
            context: Environment::from([("shift".to_string(), Value::from("night"))]),
            ..Default::default()
        };

        let started = Instant::now();
        let report = controller
            .execute_scenario_execution(&execution, options)
            .await
            .unwrap();

        assert_eq!(report.result("enter").unwrap().status, UnitStatus::Completed);
        assert_eq!(report.result("shift").unwrap().status, UnitStatus::Completed);
        assert_eq!(report.result("stay").unwrap().status, UnitStatus::Skipped);
        assert_eq!(*runner.started.lock(), vec!["enter", "shift"]);
        // Only the unmet condition waited on the store
        let wait = controller.config.condition_wait();
        assert!(started.elapsed() >= wait);
        assert!(started.elapsed() < wait * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_played_run_returns_to_stopped() {
        let (controller, _runner, _system) = controller();
        let (sender, mut receiver) = crate::events::record_channel();
        let controller = ExecutionController {
            records: Some(sender),
            ..controller
        };
        let execution = ScenarioExecution::new("seq", ExecutionMode::Sequential)
            .with_unit(unit("a", 10))
            .with_unit(unit("b", 10));

        let report = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();
        assert!(report.success);

        let state = controller.simulation_state();
        assert_eq!(state.status, SimulationStatus::Stopped);
        assert_eq!(state.current_step, 2);

        let mut transport = Vec::new();
        while let Ok(record) = receiver.try_recv() {
            if record.kind == RecordKind::Simulation {
                transport.push(record.name);
            }
        }
        assert_eq!(transport, vec!["play", "stop"]);

        // An explicit play outlives the run
        controller.play();
        controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(controller.simulation_state().status, SimulationStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let (controller, _runner, _system) = controller();
        let execution = ScenarioExecution::new("slow", ExecutionMode::Sequential)
            .with_unit(unit("a", 1000))
            .with_timeout(200);

        let err = controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrchestrationError::RunTimeout {
                execution: "slow".to_string(),
                timeout_ms: 200
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_step() {
        let (controller, runner, _system) = controller();
        controller.play();
        controller.pause();
        let execution = ScenarioExecution::new("seq", ExecutionMode::Sequential)
            .with_unit(unit("a", 0))
            .with_unit(unit("b", 0));

        let run = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .execute_scenario_execution(&execution, ExecutionOptions::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(runner.started.lock().is_empty());

        controller.step();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(*runner.started.lock(), vec!["a"]);
        assert_eq!(controller.simulation_state().status, SimulationStatus::Paused);

        controller.play();
        let report = run.await.unwrap().unwrap();
        assert!(report.success);
        assert_eq!(*runner.started.lock(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_run() {
        let (controller, runner, _system) = controller();
        let execution = ScenarioExecution::new("seq", ExecutionMode::Sequential)
            .with_unit(unit("a", 100))
            .with_unit(unit("b", 100));

        let run = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .execute_scenario_execution(&execution, ExecutionOptions::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.stop();

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err, OrchestrationError::Stopped);
        assert_eq!(*runner.started.lock(), vec!["a"]);
        assert_eq!(controller.simulation_state().status, SimulationStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_throttles_dispatch() {
        let (controller, _runner, _system) = controller();
        assert_eq!(
            controller.set_speed(0.0),
            Err(OrchestrationError::InvalidSpeed(0.0))
        );
        controller.set_speed(0.5).unwrap();

        let execution = ScenarioExecution::new("seq", ExecutionMode::Sequential)
            .with_unit(unit("a", 0))
            .with_unit(unit("b", 0));

        let started = Instant::now();
        controller
            .execute_scenario_execution(&execution, ExecutionOptions::default())
            .await
            .unwrap();

        // base 100ms × (1 − 0.5) / 0.5 per dispatch
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(controller.simulation_state().speed, 0.5);
    }
}
