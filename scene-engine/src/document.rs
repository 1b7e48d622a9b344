// Simulation Document
// YAML description of a whole simulation: state, scenes, scenarios, responders, executions

use crate::config::{ConfigError, EngineConfig};
use crate::events::{Event, EventBus, RecordSender};
use crate::expression::{extract_dependencies, EvalError, ExprParser};
use crate::orchestrator::{
    DependencyGraph, ExecutionController, ExecutionOptions, GraphError, OrchestrationError,
    RunReport, ScenarioExecution, UnitTarget,
};
use crate::scene::{ConditionSpec, Scenario, Scene};
use crate::state::{StateStore, Value};
use crate::system::System;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid simulation document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("scenario '{scenario}' references unknown scene '{scene}'")]
    UnknownScene { scenario: String, scene: String },

    #[error("execution '{execution}': unit '{unit}' targets unknown {kind} '{target}'")]
    UnknownTarget {
        execution: String,
        unit: String,
        kind: &'static str,
        target: String,
    },

    #[error("execution '{execution}': {source}")]
    Graph {
        execution: String,
        #[source]
        source: GraphError,
    },

    #[error("{location}: invalid condition '{expression}': {source}")]
    Condition {
        location: String,
        expression: String,
        #[source]
        source: EvalError,
    },

    #[error("responders need a running Tokio runtime")]
    NoRuntime,
}

/// Stand-in for an external component: reacts to one event by writing state
/// and optionally publishing another event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Responder {
    /// Event that triggers the response
    pub on: String,

    /// Event published after the state writes
    #[serde(default)]
    pub publish: Option<String>,

    #[serde(default)]
    pub payload: Option<Value>,

    #[serde(default, alias = "delayMs")]
    pub delay_ms: u64,

    /// State writes applied in key order
    #[serde(default)]
    pub set: HashMap<String, Value>,
}

/// Dependencies extracted from one condition expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionDependencies {
    /// Where the condition is declared, e.g. `scene dock pre-condition 1`
    pub location: String,
    pub expression: String,
    pub dependencies: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationDocument {
    pub name: Option<String>,
    pub config: EngineConfig,
    #[serde(alias = "initialState")]
    pub initial_state: HashMap<String, Value>,
    pub scenes: Vec<Scene>,
    pub scenarios: Vec<Scenario>,
    pub responders: Vec<Responder>,
    pub executions: Vec<ScenarioExecution>,
}

impl SimulationDocument {
    pub fn from_yaml_str(content: &str) -> Result<Self, DocumentError> {
        let document: SimulationDocument = serde_yaml::from_str(content)?;
        document.config.validate()?;
        Ok(document)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Check names, references, dependency cycles and condition syntax
    pub fn validate(&self) -> Result<(), DocumentError> {
        let scenes = unique_names("scene", self.scenes.iter().map(|s| s.name.as_str()))?;
        let scenarios =
            unique_names("scenario", self.scenarios.iter().map(|s| s.name.as_str()))?;
        unique_names("execution", self.executions.iter().map(|e| e.name.as_str()))?;

        for scenario in &self.scenarios {
            for step in &scenario.steps {
                if !scenes.contains(step.scene_name()) {
                    return Err(DocumentError::UnknownScene {
                        scenario: scenario.name.clone(),
                        scene: step.scene_name().to_string(),
                    });
                }
            }
        }

        for execution in &self.executions {
            for unit in &execution.units {
                let (kind, known) = match &unit.target {
                    UnitTarget::Scene(name) => ("scene", scenes.contains(name.as_str())),
                    UnitTarget::Scenario(name) => ("scenario", scenarios.contains(name.as_str())),
                };
                if !known {
                    return Err(DocumentError::UnknownTarget {
                        execution: execution.name.clone(),
                        unit: unit.name.clone(),
                        kind,
                        target: unit.target.name().to_string(),
                    });
                }
            }

            let graph_error = |source| DocumentError::Graph {
                execution: execution.name.clone(),
                source,
            };
            DependencyGraph::build(execution)
                .and_then(|graph| graph.topological_order())
                .map_err(graph_error)?;
        }

        for (location, expression) in self.condition_expressions() {
            if let Err(err) = ExprParser::parse_str(&expression) {
                return Err(DocumentError::Condition {
                    location,
                    expression,
                    source: err.into(),
                });
            }
        }

        Ok(())
    }

    /// State paths each declared condition depends on
    pub fn condition_dependencies(&self) -> Vec<ConditionDependencies> {
        self.condition_expressions()
            .into_iter()
            .map(|(location, expression)| ConditionDependencies {
                dependencies: extract_dependencies(&expression),
                location,
                expression,
            })
            .collect()
    }

    fn condition_expressions(&self) -> Vec<(String, String)> {
        let mut expressions = Vec::new();
        let mut push = |location: String, conditions: &[ConditionSpec]| {
            for (i, condition) in conditions.iter().enumerate() {
                if let Some(expression) = condition.expression() {
                    expressions.push((format!("{location} {}", i + 1), expression.to_string()));
                }
            }
        };

        for scene in &self.scenes {
            push(format!("scene {} pre-condition", scene.name), &scene.pre_conditions);
            push(format!("scene {} post-condition", scene.name), &scene.post_conditions);
        }
        for execution in &self.executions {
            for unit in &execution.units {
                push(
                    format!("execution {} unit {} pre-condition", execution.name, unit.name),
                    &unit.pre_conditions,
                );
            }
        }
        expressions
    }

    /// Validate, then build a running simulation. Must be called inside a
    /// Tokio runtime when the document declares responders.
    pub fn load(self, records: Option<RecordSender>) -> Result<Simulation, DocumentError> {
        self.validate()?;

        if !self.responders.is_empty() && tokio::runtime::Handle::try_current().is_err() {
            return Err(DocumentError::NoRuntime);
        }

        let system = System::with_records(self.config, records);

        let mut initial: Vec<(String, Value)> = self.initial_state.into_iter().collect();
        initial.sort_by(|a, b| a.0.cmp(&b.0));
        system.store().set_many(initial);

        for scene in self.scenes {
            system.scenes().register_scene(scene);
        }
        for scenario in self.scenarios {
            system.scenarios().register_scenario(scenario);
        }

        let responders = self
            .responders
            .into_iter()
            .map(|responder| {
                // Subscribe before any scene can publish
                let events = system.bus().subscribe_all();
                tokio::spawn(respond(
                    system.store().clone(),
                    system.bus().clone(),
                    events,
                    responder,
                ))
            })
            .collect();

        let controller = system.controller();
        tracing::info!(
            simulation = self.name.as_deref().unwrap_or("unnamed"),
            executions = self.executions.len(),
            "simulation loaded"
        );

        Ok(Simulation {
            name: self.name,
            system,
            controller,
            executions: self.executions,
            responders,
        })
    }
}

fn unique_names<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>, DocumentError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(DocumentError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(seen)
}

async fn respond(
    store: StateStore,
    bus: EventBus,
    mut events: broadcast::Receiver<Event>,
    responder: Responder,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.name == responder.on => {
                tokio::spawn(fire(store.clone(), bus.clone(), responder.clone(), event));
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(on = %responder.on, missed, "responder lagged behind the event bus");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn fire(store: StateStore, bus: EventBus, responder: Responder, event: Event) {
    if responder.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(responder.delay_ms)).await;
    }

    let mut writes: Vec<(String, Value)> = responder.set.into_iter().collect();
    writes.sort_by(|a, b| a.0.cmp(&b.0));
    store.set_many(writes);

    if let Some(name) = responder.publish {
        tracing::debug!(on = %event.name, publish = %name, "responder fired");
        bus.publish(name, responder.payload.unwrap_or(Value::Null));
    }
}

/// A loaded simulation document
pub struct Simulation {
    name: Option<String>,
    system: System,
    controller: ExecutionController,
    executions: Vec<ScenarioExecution>,
    responders: Vec<JoinHandle<()>>,
}

impl Simulation {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn controller(&self) -> &ExecutionController {
        &self.controller
    }

    pub fn executions(&self) -> &[ScenarioExecution] {
        &self.executions
    }

    pub fn execution(&self, name: &str) -> Option<&ScenarioExecution> {
        self.executions.iter().find(|e| e.name == name)
    }

    pub async fn run(
        &self,
        name: &str,
        options: ExecutionOptions,
    ) -> Result<RunReport, OrchestrationError> {
        let execution = self
            .execution(name)
            .ok_or_else(|| OrchestrationError::UnknownScenario(name.to_string()))?;
        self.controller
            .execute_scenario_execution(execution, options)
            .await
    }

    /// Run every execution in document order
    pub async fn run_all(
        &self,
        options: ExecutionOptions,
    ) -> Vec<(String, Result<RunReport, OrchestrationError>)> {
        let mut reports = Vec::with_capacity(self.executions.len());
        for execution in &self.executions {
            let report = self
                .controller
                .execute_scenario_execution(execution, options.clone())
                .await;
            reports.push((execution.name.clone(), report));
        }
        reports
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        for responder in &self.responders {
            responder.abort();
        }
    }
}
