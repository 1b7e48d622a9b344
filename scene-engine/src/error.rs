// Engine Errors
// Crate-level error wrapping every subsystem error

use crate::config::ConfigError;
use crate::document::DocumentError;
use crate::expression::EvalError;
use crate::orchestrator::{GraphError, OrchestrationError};
use crate::reactive::WatchError;
use crate::scene::SceneError;

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Expression(#[from] EvalError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

impl EngineError {
    /// Short machine-readable category
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Document(_) => "document",
            EngineError::Expression(_) => "expression",
            EngineError::Watch(_) => "watch",
            EngineError::Scene(err) => err.kind(),
            EngineError::Graph(_) => "graph",
            EngineError::Orchestration(_) => "orchestration",
        }
    }
}
