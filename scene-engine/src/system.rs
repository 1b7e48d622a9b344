// System Context
// Owns one store, bus, evaluator, watcher and scene executor per simulation

use crate::config::EngineConfig;
use crate::events::{EventBus, RecordSender};
use crate::expression::{ExpressionEngine, ExpressionEvaluator};
use crate::orchestrator::ExecutionController;
use crate::reactive::ReactiveConditionWatcher;
use crate::scene::{ScenarioExecutor, SceneExecutor};
use crate::state::StateStore;

use std::fmt;
use std::sync::Arc;

/// Shared engine components, wired together from one [`EngineConfig`]
#[derive(Clone)]
pub struct System {
    config: EngineConfig,
    store: StateStore,
    bus: EventBus,
    evaluator: Arc<dyn ExpressionEvaluator>,
    watcher: ReactiveConditionWatcher,
    scenarios: ScenarioExecutor,
    records: Option<RecordSender>,
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("config", &self.config)
            .field("state_paths", &self.store.len())
            .field("watcher", &self.watcher)
            .field("scenes", self.scenarios.scene_executor())
            .finish()
    }
}

impl System {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_records(config, None)
    }

    /// System whose components all report to the same record sink
    pub fn with_records(config: EngineConfig, records: Option<RecordSender>) -> Self {
        Self::with_evaluator(config, Arc::new(ExpressionEngine::new()), records)
    }

    /// System with a custom expression evaluator
    pub fn with_evaluator(
        config: EngineConfig,
        evaluator: Arc<dyn ExpressionEvaluator>,
        records: Option<RecordSender>,
    ) -> Self {
        let store = StateStore::new();
        let bus = EventBus::new();
        let watcher = ReactiveConditionWatcher::with_records(
            store.clone(),
            Arc::clone(&evaluator),
            config.watcher.clone(),
            records.clone(),
        );
        let scenes = SceneExecutor::with_records(
            store.clone(),
            bus.clone(),
            Arc::clone(&evaluator),
            config.scenes.clone(),
            records.clone(),
        );
        let scenarios = ScenarioExecutor::new(scenes, records.clone());

        Self {
            config,
            store,
            bus,
            evaluator,
            watcher,
            scenarios,
            records,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    pub fn watcher(&self) -> &ReactiveConditionWatcher {
        &self.watcher
    }

    pub fn scenes(&self) -> &SceneExecutor {
        self.scenarios.scene_executor()
    }

    pub fn scenarios(&self) -> &ScenarioExecutor {
        &self.scenarios
    }

    pub fn records(&self) -> Option<&RecordSender> {
        self.records.as_ref()
    }

    /// New orchestrator over this system's scenes and scenarios
    pub fn controller(&self) -> ExecutionController {
        ExecutionController::new(self)
    }
}
