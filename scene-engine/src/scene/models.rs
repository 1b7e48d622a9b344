// Scene Models
// Scene definitions, guard conditions and per-invocation execution records

use crate::expression::Environment;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Custom guard evaluated against the merged state + context environment
pub type Predicate = Arc<dyn Fn(&Environment) -> bool + Send + Sync>;

/// A pre- or post-condition
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    /// Bare expression: `agv1.docked == true`
    Expression(String),

    /// Expression with a human-readable description
    Described {
        expression: String,
        #[serde(default)]
        description: Option<String>,
    },

    /// Code-supplied predicate (not representable in documents)
    #[serde(skip)]
    Predicate {
        description: String,
        predicate: Predicate,
    },
}

impl ConditionSpec {
    pub fn predicate<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Environment) -> bool + Send + Sync + 'static,
    {
        Self::Predicate {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Expression text, if the condition is expression-based
    pub fn expression(&self) -> Option<&str> {
        match self {
            ConditionSpec::Expression(expression) => Some(expression),
            ConditionSpec::Described { expression, .. } => Some(expression),
            ConditionSpec::Predicate { .. } => None,
        }
    }

    /// Label used in errors and records
    pub fn label(&self) -> &str {
        match self {
            ConditionSpec::Expression(expression) => expression,
            ConditionSpec::Described {
                expression,
                description,
            } => description.as_deref().unwrap_or(expression),
            ConditionSpec::Predicate { description, .. } => description,
        }
    }
}

impl fmt::Debug for ConditionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionSpec::Expression(expression) => {
                f.debug_tuple("Expression").field(expression).finish()
            }
            ConditionSpec::Described {
                expression,
                description,
            } => f
                .debug_struct("Described")
                .field("expression", expression)
                .field("description", description)
                .finish(),
            ConditionSpec::Predicate { description, .. } => f
                .debug_struct("Predicate")
                .field("description", description)
                .finish_non_exhaustive(),
        }
    }
}

impl From<&str> for ConditionSpec {
    fn from(expression: &str) -> Self {
        ConditionSpec::Expression(expression.to_string())
    }
}

impl From<String> for ConditionSpec {
    fn from(expression: String) -> Self {
        ConditionSpec::Expression(expression)
    }
}

/// Immutable scene template, registered once and executed many times
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Event published when the scene starts
    #[serde(default, alias = "startEvent")]
    pub start_event: Option<String>,

    /// Event that completes the scene; without one the scene completes immediately
    #[serde(default, alias = "finishEvent")]
    pub finish_event: Option<String>,

    #[serde(default, alias = "preConditions")]
    pub pre_conditions: Vec<ConditionSpec>,

    #[serde(default, alias = "postConditions")]
    pub post_conditions: Vec<ConditionSpec>,

    /// Finish-event timeout; the executor default applies when unset
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,

    /// Additional attempts after the first
    #[serde(default, alias = "maxRetries")]
    pub max_retries: u32,

    #[serde(default)]
    pub priority: i32,
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            start_event: None,
            finish_event: None,
            pre_conditions: Vec::new(),
            post_conditions: Vec::new(),
            timeout_ms: None,
            max_retries: 0,
            priority: 0,
        }
    }

    pub fn with_start_event(mut self, event: impl Into<String>) -> Self {
        self.start_event = Some(event.into());
        self
    }

    pub fn with_finish_event(mut self, event: impl Into<String>) -> Self {
        self.finish_event = Some(event.into());
        self
    }

    pub fn with_pre_condition(mut self, condition: impl Into<ConditionSpec>) -> Self {
        self.pre_conditions.push(condition.into());
        self
    }

    pub fn with_post_condition(mut self, condition: impl Into<ConditionSpec>) -> Self {
        self.post_conditions.push(condition.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Scene execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SceneStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SceneStatus::Running)
    }
}

/// Lifecycle phase of a scene attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenePhase {
    Started,
    PreConditions,
    StartEvent,
    WaitingFinish,
    PostConditions,
    Completed,
    Failed,
}

impl ScenePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenePhase::Started => "started",
            ScenePhase::PreConditions => "pre_conditions",
            ScenePhase::StartEvent => "start_event",
            ScenePhase::WaitingFinish => "waiting_finish",
            ScenePhase::PostConditions => "post_conditions",
            ScenePhase::Completed => "completed",
            ScenePhase::Failed => "failed",
        }
    }
}

impl fmt::Display for ScenePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable record of one scene invocation
#[derive(Debug, Clone)]
pub struct SceneExecution {
    pub execution_id: Uuid,
    pub scene_id: String,
    pub scene: Arc<Scene>,
    pub context: Environment,
    pub status: SceneStatus,
    pub phase: ScenePhase,
    /// Retries performed so far (attempts - 1)
    pub retry_count: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SceneExecution {
    pub fn new(scene: Arc<Scene>, context: Environment) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            scene_id: scene.name.clone(),
            scene,
            context,
            status: SceneStatus::Running,
            phase: ScenePhase::Started,
            retry_count: 0,
            start_time: Utc::now(),
            end_time: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Successful scene result
#[derive(Debug, Clone, PartialEq)]
pub struct SceneOutcome {
    pub execution_id: Uuid,
    pub scene: String,
    pub duration: Duration,
    pub attempts: u32,
    /// Execution context, including any finish-event payload under `event.<name>`
    pub context: Environment,
}

/// Scene lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SceneError {
    #[error("scene '{0}' is not registered")]
    NotFound(String),

    #[error("scene '{scene}' rejected: {active} of {limit} scenes already active")]
    AdmissionRejected {
        scene: String,
        active: usize,
        limit: usize,
    },

    #[error("pre-condition '{condition}' of scene '{scene}' failed: {reason}")]
    PreConditionFailed {
        scene: String,
        condition: String,
        reason: String,
    },

    #[error("post-condition '{condition}' of scene '{scene}' failed: {reason}")]
    PostConditionFailed {
        scene: String,
        condition: String,
        reason: String,
    },

    #[error("scene '{scene}' timed out after {timeout_ms}ms waiting for '{event}'")]
    SceneTimeout {
        scene: String,
        event: String,
        timeout_ms: u64,
    },

    #[error("scene '{0}' was stopped")]
    Stopped(String),
}

impl SceneError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SceneError::PreConditionFailed { .. }
                | SceneError::PostConditionFailed { .. }
                | SceneError::SceneTimeout { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SceneError::NotFound(_) => "not_found",
            SceneError::AdmissionRejected { .. } => "admission_rejected",
            SceneError::PreConditionFailed { .. } => "pre_condition_failed",
            SceneError::PostConditionFailed { .. } => "post_condition_failed",
            SceneError::SceneTimeout { .. } => "scene_timeout",
            SceneError::Stopped(_) => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_from_yaml() {
        let yaml = r#"
name: dock
startEvent: dock.request
finish_event: dock.done
preConditions:
  - agv1.battery > 20
  - expression: "dock.free == true"
    description: dock is free
timeout_ms: 500
max_retries: 2
"#;
        let scene: Scene = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scene.start_event.as_deref(), Some("dock.request"));
        assert_eq!(scene.finish_event.as_deref(), Some("dock.done"));
        assert_eq!(scene.pre_conditions.len(), 2);
        assert_eq!(scene.pre_conditions[0].label(), "agv1.battery > 20");
        assert_eq!(scene.pre_conditions[1].label(), "dock is free");
        assert_eq!(scene.pre_conditions[1].expression(), Some("dock.free == true"));
        assert_eq!(scene.timeout_ms, Some(500));
        assert_eq!(scene.max_retries, 2);
        assert!(scene.post_conditions.is_empty());
    }

    #[test]
    fn test_predicate_condition() {
        let condition = ConditionSpec::predicate("always", |_| true);
        assert_eq!(condition.label(), "always");
        assert!(condition.expression().is_none());
        assert!(format!("{:?}", condition).contains("always"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SceneError::SceneTimeout {
            scene: "s".to_string(),
            event: "done".to_string(),
            timeout_ms: 500,
        }
        .is_retryable());
        assert!(!SceneError::AdmissionRejected {
            scene: "s".to_string(),
            active: 10,
            limit: 10,
        }
        .is_retryable());
        assert!(!SceneError::Stopped("s".to_string()).is_retryable());
    }
}
