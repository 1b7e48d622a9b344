// Scene Engine Library
// Reactive state, condition watching and scene orchestration for architecture simulations

pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod expression;
pub mod orchestrator;
pub mod reactive;
pub mod scene;
pub mod state;
pub mod system;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};

pub use config::{ConfigError, ControllerConfig, EngineConfig, SceneExecutorConfig, WatcherConfig};

pub use document::{ConditionDependencies, DocumentError, Responder, Simulation, SimulationDocument};

pub use events::{
    record_channel, Event, EventBus, LogRecord, RecordKind, RecordReceiver, RecordResult,
    RecordSender, RecordSink,
};

pub use expression::{
    extract_dependencies, Environment, EvalError, ExpressionEngine, ExpressionEvaluator,
};

pub use orchestrator::{
    ExecutionController, ExecutionMode, ExecutionOptions, OrchestrationError, RunAnalytics,
    RunReport, ScenarioExecution, ScenarioUnit, SimulationState, SimulationStatus, UnitResult,
    UnitRunner, UnitStatus, UnitTarget,
};

pub use reactive::{ConditionTrigger, ReactiveConditionWatcher, WatchError, WatchHandle, WatchOptions};

pub use scene::{
    ConditionSpec, Scenario, ScenarioExecutor, Scene, SceneError, SceneExecutor, SceneOutcome,
};

pub use state::{StateChange, StateStore, Value};

pub use system::System;
