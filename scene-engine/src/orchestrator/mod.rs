// Orchestrator Module
// Scenario executions: dependency graph, dispatch modes and simulation transport

pub mod analytics;
pub mod controller;
pub mod graph;
pub mod models;
pub mod simulation;

pub use analytics::{ConcurrencyGauge, RunAnalytics};
pub use controller::{ExecutionController, SceneUnitRunner, UnitRunner};
pub use graph::{DependencyGraph, GraphError};
pub use models::{
    ExecutionMode, ExecutionOptions, OrchestrationError, RunReport, ScenarioExecution,
    ScenarioUnit, UnitResult, UnitStatus, UnitTarget,
};
pub use simulation::{SimulationClock, SimulationState, SimulationStatus};
