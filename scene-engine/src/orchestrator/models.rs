// Orchestration Models
// Scenario execution definitions, run options and run reports

use crate::expression::Environment;
use crate::orchestrator::analytics::RunAnalytics;
use crate::orchestrator::graph::GraphError;
use crate::scene::{ConditionSpec, SceneError};
use crate::state::Value;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// How the units of an execution are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One unit at a time, in order
    #[default]
    Sequential,
    /// Fixed-size chunks with a barrier between chunks
    Parallel,
    /// Sequential, skipping units whose pre-conditions stay false
    Conditional,
    /// Ready-set scheduling over the dependency graph
    Dependency,
}

/// What a unit runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitTarget {
    Scene(String),
    Scenario(String),
}

impl UnitTarget {
    pub fn name(&self) -> &str {
        match self {
            UnitTarget::Scene(name) | UnitTarget::Scenario(name) => name,
        }
    }
}

/// One schedulable entry of a scenario execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioUnit {
    pub name: String,

    #[serde(flatten)]
    pub target: UnitTarget,

    /// Merged over the run context before dispatch
    #[serde(default)]
    pub context: HashMap<String, Value>,

    /// Only consulted in conditional mode
    #[serde(default, alias = "preConditions")]
    pub pre_conditions: Vec<ConditionSpec>,

    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
}

impl ScenarioUnit {
    pub fn scene(name: impl Into<String>, scene: impl Into<String>) -> Self {
        Self::with_target(name, UnitTarget::Scene(scene.into()))
    }

    pub fn scenario(name: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self::with_target(name, UnitTarget::Scenario(scenario.into()))
    }

    fn with_target(name: impl Into<String>, target: UnitTarget) -> Self {
        Self {
            name: name.into(),
            target,
            context: HashMap::new(),
            pre_conditions: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_pre_condition(mut self, condition: impl Into<ConditionSpec>) -> Self {
        self.pre_conditions.push(condition.into());
        self
    }

    pub fn depends_on(mut self, unit: impl Into<String>) -> Self {
        self.depends_on.push(unit.into());
        self
    }
}

/// A named orchestration of units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioExecution {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(alias = "scenarios")]
    pub units: Vec<ScenarioUnit>,

    #[serde(default, alias = "executionMode", alias = "mode")]
    pub execution_mode: ExecutionMode,

    /// Unit name to the units it waits for; merged with each unit's `depends_on`
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,

    #[serde(default, alias = "continueOnError")]
    pub continue_on_error: bool,

    /// Whole-run timeout
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,

    #[serde(default, alias = "maxConcurrentScenarios")]
    pub max_concurrent_scenarios: Option<usize>,
}

impl ScenarioExecution {
    pub fn new(name: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            name: name.into(),
            description: None,
            units: Vec::new(),
            execution_mode: mode,
            dependencies: HashMap::new(),
            continue_on_error: false,
            timeout_ms: None,
            max_concurrent_scenarios: None,
        }
    }

    pub fn with_unit(mut self, unit: ScenarioUnit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn with_dependency(mut self, unit: impl Into<String>, depends_on: impl Into<String>) -> Self {
        self.dependencies
            .entry(unit.into())
            .or_default()
            .push(depends_on.into());
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_scenarios = Some(max);
        self
    }

    pub fn unit(&self, name: &str) -> Option<&ScenarioUnit> {
        self.units.iter().find(|u| u.name == name)
    }
}

/// Per-run overrides of the execution definition
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub continue_on_error: Option<bool>,
    pub max_concurrent_scenarios: Option<usize>,
    pub timeout_ms: Option<u64>,
    /// Base context handed to every unit
    pub context: Environment,
}

/// Final state of one unit in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    Failed,
    Skipped,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitResult {
    pub name: String,
    pub status: UnitStatus,
    pub duration: Duration,
    pub error: Option<SceneError>,
    /// Why the unit was skipped
    pub reason: Option<String>,
}

impl UnitResult {
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: UnitStatus::Skipped,
            duration: Duration::ZERO,
            error: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, UnitStatus::Failed | UnitStatus::Stopped)
    }
}

/// Result of a whole scenario execution
#[derive(Debug, Clone)]
pub struct RunReport {
    pub name: String,
    pub success: bool,
    /// Unit results in settlement order
    pub results: Vec<UnitResult>,
    pub duration: Duration,
    pub analytics: RunAnalytics,
}

impl RunReport {
    pub fn result(&self, unit: &str) -> Option<&UnitResult> {
        self.results.iter().find(|r| r.name == unit)
    }
}

/// Run-level failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestrationError {
    #[error("circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("dependency deadlock: no unit is ready, outstanding: {}", .pending.join(", "))]
    DependencyDeadlock { pending: Vec<String> },

    #[error("unit '{unit}' failed: {source}")]
    UnitFailed {
        unit: String,
        #[source]
        source: SceneError,
    },

    #[error("unit '{unit}' aborted: {message}")]
    UnitAborted { unit: String, message: String },

    #[error("execution '{execution}' timed out after {timeout_ms}ms")]
    RunTimeout { execution: String, timeout_ms: u64 },

    #[error("execution stopped")]
    Stopped,

    #[error("invalid speed {0}: must be a positive number")]
    InvalidSpeed(f64),

    #[error("no scenario execution named '{0}'")]
    UnknownScenario(String),

    #[error("invalid execution: {0}")]
    Graph(GraphError),
}

impl From<GraphError> for OrchestrationError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CircularDependency(cycle) => OrchestrationError::CircularDependency(cycle),
            other => OrchestrationError::Graph(other),
        }
    }
}
