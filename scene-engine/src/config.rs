// Engine Configuration
// Tunables for the watcher, scene executor and orchestrator

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Reactive condition watcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Conditions reading more paths than this are polled instead
    pub max_dependencies: usize,
    /// Poll period for conditions without usable dependencies
    pub fallback_interval_ms: u64,
}

impl WatcherConfig {
    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_dependencies: 50,
            fallback_interval_ms: 1000,
        }
    }
}

/// Scene executor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneExecutorConfig {
    /// Admission ceiling for concurrently active scenes
    pub max_concurrent_scenes: usize,
    /// Fixed delay before each retry
    pub retry_delay_ms: u64,
    /// Finish-event timeout for scenes that do not declare one
    pub default_timeout_ms: u64,
}

impl SceneExecutorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for SceneExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scenes: 10,
            retry_delay_ms: 1000,
            default_timeout_ms: 30_000,
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Chunk size in parallel mode and concurrency bound in dependency mode
    pub max_concurrent_scenarios: usize,
    /// How often a paused run re-checks the simulation state
    pub pause_poll_interval_ms: u64,
    /// Bounded wait for unit pre-conditions in conditional mode
    pub condition_wait_ms: u64,
    /// Delay unit scaled by the simulation speed
    pub base_step_delay_ms: u64,
}

impl ControllerConfig {
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    pub fn condition_wait(&self) -> Duration {
        Duration::from_millis(self.condition_wait_ms)
    }

    pub fn base_step_delay(&self) -> Duration {
        Duration::from_millis(self.base_step_delay_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scenarios: 4,
            pause_poll_interval_ms: 100,
            condition_wait_ms: 500,
            base_step_delay_ms: 100,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub watcher: WatcherConfig,
    pub scenes: SceneExecutorConfig,
    pub controller: ControllerConfig,
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Reject settings that would stall the engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenes.max_concurrent_scenes == 0 {
            return Err(ConfigError::Invalid(
                "scenes.max_concurrent_scenes must be at least 1".to_string(),
            ));
        }
        if self.controller.max_concurrent_scenarios == 0 {
            return Err(ConfigError::Invalid(
                "controller.max_concurrent_scenarios must be at least 1".to_string(),
            ));
        }
        if self.watcher.fallback_interval_ms == 0 || self.controller.pause_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
