// Scenario Executor
// Runs a named, ordered list of scene steps

use crate::events::{LogRecord, RecordKind, RecordResult, RecordSender, RecordSink};
use crate::expression::Environment;
use crate::scene::executor::SceneExecutor;
use crate::scene::models::SceneError;
use crate::state::Value;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One step of a scenario: a scene name, optionally with extra context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioStep {
    Scene(String),
    WithContext {
        scene: String,
        #[serde(default)]
        context: HashMap<String, Value>,
    },
}

impl ScenarioStep {
    pub fn scene_name(&self) -> &str {
        match self {
            ScenarioStep::Scene(scene) | ScenarioStep::WithContext { scene, .. } => scene,
        }
    }

    pub fn context(&self) -> Option<&HashMap<String, Value>> {
        match self {
            ScenarioStep::Scene(_) => None,
            ScenarioStep::WithContext { context, .. } => Some(context),
        }
    }
}

impl From<&str> for ScenarioStep {
    fn from(scene: &str) -> Self {
        ScenarioStep::Scene(scene.to_string())
    }
}

/// Named sequence of scenes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub steps: Vec<ScenarioStep>,

    /// Keep running later steps after a failed one
    #[serde(default, alias = "continueOnError")]
    pub continue_on_error: bool,
}

impl Scenario {
    pub fn new<I, S>(name: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ScenarioStep>,
    {
        Self {
            name: name.into(),
            description: None,
            steps: steps.into_iter().map(Into::into).collect(),
            continue_on_error: false,
        }
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }
}

/// Result of a scenario run
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub name: String,
    pub success: bool,
    pub duration: Duration,
    /// Scenes that completed, in order
    pub completed: Vec<String>,
    /// Failed steps (only populated with continue-on-error)
    pub failures: Vec<(String, SceneError)>,
    /// Context after the last step
    pub context: Environment,
}

/// Runs scenarios step by step on a shared [`SceneExecutor`]
#[derive(Debug, Clone)]
pub struct ScenarioExecutor {
    scenes: SceneExecutor,
    scenarios: Arc<RwLock<HashMap<String, Arc<Scenario>>>>,
    records: Option<RecordSender>,
}

impl ScenarioExecutor {
    pub fn new(scenes: SceneExecutor, records: Option<RecordSender>) -> Self {
        Self {
            scenes,
            scenarios: Arc::new(RwLock::new(HashMap::new())),
            records,
        }
    }

    pub fn register_scenario(&self, scenario: Scenario) {
        tracing::debug!(scenario = %scenario.name, steps = scenario.steps.len(), "scenario registered");
        self.scenarios
            .write()
            .insert(scenario.name.clone(), Arc::new(scenario));
    }

    pub fn scenario(&self, name: &str) -> Option<Arc<Scenario>> {
        self.scenarios.read().get(name).cloned()
    }

    pub fn has_scenario(&self, name: &str) -> bool {
        self.scenarios.read().contains_key(name)
    }

    pub fn scenario_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scenarios.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn scene_executor(&self) -> &SceneExecutor {
        &self.scenes
    }

    /// Run each step in order. The context returned by one step feeds the next.
    ///
    /// Without `continue_on_error` the first failing step aborts the scenario
    /// and its error is returned.
    pub async fn execute_scenario(
        &self,
        scenario: &Scenario,
        context: Environment,
    ) -> Result<ScenarioOutcome, SceneError> {
        let started = Instant::now();
        let mut context = context;
        let mut completed = Vec::new();
        let mut failures = Vec::new();

        tracing::debug!(scenario = %scenario.name, "scenario started");

        for step in &scenario.steps {
            let mut step_context = context.clone();
            if let Some(extra) = step.context() {
                step_context.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            }

            match self.scenes.execute_scene(step.scene_name(), step_context).await {
                Ok(outcome) => {
                    context = outcome.context;
                    completed.push(outcome.scene);
                }
                Err(err) if scenario.continue_on_error && !matches!(err, SceneError::Stopped(_)) => {
                    failures.push((step.scene_name().to_string(), err));
                }
                Err(err) => {
                    self.records.emit(
                        LogRecord::new(
                            RecordKind::Scenario,
                            &scenario.name,
                            format!("scenario/{}", scenario.name),
                            RecordResult::Failure,
                        )
                        .with_duration(started.elapsed())
                        .with_message(err.to_string())
                        .with_meta("failed_step", step.scene_name()),
                    );
                    return Err(err);
                }
            }
        }

        let outcome = ScenarioOutcome {
            name: scenario.name.clone(),
            success: failures.is_empty(),
            duration: started.elapsed(),
            completed,
            failures,
            context,
        };

        self.records.emit(
            LogRecord::new(
                RecordKind::Scenario,
                &scenario.name,
                format!("scenario/{}", scenario.name),
                if outcome.success {
                    RecordResult::Success
                } else {
                    RecordResult::Failure
                },
            )
            .with_duration(outcome.duration)
            .with_meta("completed", outcome.completed.len())
            .with_meta("failed", outcome.failures.len()),
        );

        Ok(outcome)
    }
}
