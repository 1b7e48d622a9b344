// End-to-end behaviour of the watcher, scene executor and orchestrator

use scene_engine::{
    EngineConfig, Environment, ExecutionMode, ExecutionOptions, OrchestrationError,
    ScenarioExecution, ScenarioUnit, Scene, SceneError, System, UnitRunner, Value, WatchOptions,
};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn counter() -> (Arc<AtomicUsize>, impl Fn(&scene_engine::ConditionTrigger) + Send + Sync) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move |_: &scene_engine::ConditionTrigger| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn dependency_isolation() {
    let system = System::new(EngineConfig::default());
    let store = system.store();
    store.set_value("p", 1);

    let (_, callback) = counter();
    system
        .watcher()
        .watch_condition("watch-p", "p > 5", callback, WatchOptions::default())
        .unwrap();
    let before = system.watcher().condition_stats("watch-p").unwrap().evaluation_count;

    for i in 0..20 {
        store.set_value("q", i);
        store.set_value("p_other", i);
        store.set_value("pp", i);
    }

    let after = system.watcher().condition_stats("watch-p").unwrap().evaluation_count;
    assert_eq!(before, after);
}

#[test]
fn edge_trigger() {
    let system = System::new(EngineConfig::default());
    let store = system.store();
    store.set_value("x", false);

    let (count, callback) = counter();
    system
        .watcher()
        .watch_condition("x-true", "x == true", callback, WatchOptions::default())
        .unwrap();

    store.set_value("x", true);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    store.set_value("x", true);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    store.set_value("x", false);
    store.set_value("x", true);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn max_triggers_unregisters() {
    let system = System::new(EngineConfig::default());
    let store = system.store();
    store.set_value("x", false);

    let (count, callback) = counter();
    let handle = system
        .watcher()
        .watch_condition(
            "limited",
            "x == true",
            callback,
            WatchOptions::default().with_max_triggers(2),
        )
        .unwrap();

    for _ in 0..3 {
        store.set_value("x", true);
        store.set_value("x", false);
    }

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(!handle.is_active());
    assert!(system.watcher().condition_stats("limited").is_none());
}

#[test]
fn temperature_alert_reports_value_once() {
    let system = System::new(EngineConfig::default());
    let store = system.store();
    store.set_value("temperature", 20.0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    system
        .watcher()
        .watch_condition(
            "alert",
            "temperature >= 25.0",
            move |trigger| sink.lock().push(trigger.changed_value.clone()),
            WatchOptions::default(),
        )
        .unwrap();

    store.set_value("temperature", 26.5);
    store.set_value("temperature", 26.5);

    assert_eq!(*seen.lock(), vec![Some(Value::Number(26.5))]);
}

#[tokio::test(start_paused = true)]
async fn retry_bound() {
    let system = System::new(EngineConfig::default());
    system.scenes().register_scene(
        Scene::new("stubborn")
            .with_post_condition("never == true")
            .with_max_retries(2),
    );
    system.store().set_value("never", false);

    let err = system
        .scenes()
        .execute_scene("stubborn", Environment::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SceneError::PostConditionFailed { .. }));
    assert_eq!(system.scenes().stats().total_attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn finish_event_beats_timeout() {
    let system = System::new(EngineConfig::default());
    system.scenes().register_scene(
        Scene::new("wait-done")
            .with_finish_event("done")
            .with_timeout(500),
    );

    let bus = system.bus().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.publish("done", Value::Null);
    });

    let started = Instant::now();
    let outcome = system
        .scenes()
        .execute_scene("wait-done", Environment::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(500));
    assert_eq!(outcome.attempts, 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let stats = system.scenes().stats();
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn dependency_deadlock_is_detected() {
    let system = System::new(EngineConfig::default());
    system.scenes().register_scene(Scene::new("noop"));
    let controller = system.controller();

    let execution = ScenarioExecution::new("deadlock", ExecutionMode::Dependency)
        .with_unit(ScenarioUnit::scene("A", "noop").depends_on("B"))
        .with_unit(ScenarioUnit::scene("B", "noop").depends_on("A"));

    let run = controller.execute_scenario_execution(&execution, ExecutionOptions::default());
    let err = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("deadlock must not hang")
        .unwrap_err();

    assert_eq!(
        err,
        OrchestrationError::DependencyDeadlock {
            pending: vec!["A".to_string(), "B".to_string()]
        }
    );
}

struct SleepRunner;

#[async_trait::async_trait]
impl UnitRunner for SleepRunner {
    async fn run_unit(&self, _unit: &ScenarioUnit, _context: Environment) -> Result<(), SceneError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn parallel_mode_bounds_concurrency() {
    let system = System::new(EngineConfig::default());
    let controller =
        scene_engine::ExecutionController::with_runner(&system, Arc::new(SleepRunner));

    let mut execution =
        ScenarioExecution::new("bounded", ExecutionMode::Parallel).with_max_concurrent(2);
    for i in 0..5 {
        execution = execution.with_unit(ScenarioUnit::scene(format!("unit-{i}"), "noop"));
    }

    let peak = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let controller = controller.clone();
        let peak = Arc::clone(&peak);
        tokio::spawn(async move {
            loop {
                peak.fetch_max(controller.in_flight(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let report = controller
        .execute_scenario_execution(&execution, ExecutionOptions::default())
        .await
        .unwrap();
    sampler.abort();

    assert!(report.success);
    assert_eq!(report.results.len(), 5);
    assert_eq!(report.analytics.peak_concurrency, 2);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}
