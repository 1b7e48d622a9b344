// Scene Module
// Atomic event-driven scenes and sequential scenarios

pub mod executor;
pub mod models;
pub mod scenario;

pub use executor::{SceneExecutor, SceneStats};
pub use models::{
    ConditionSpec, Predicate, Scene, SceneError, SceneExecution, SceneOutcome, ScenePhase,
    SceneStatus,
};
pub use scenario::{Scenario, ScenarioExecutor, ScenarioOutcome, ScenarioStep};
