//! Solstice Config
//!
//! This crate contains the serializable configuration types for Solstice.
//! These types describe pipelines, dead-letter queue routing and engine
//! policy before they are validated into runtime structures.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI with `--config=solstice.json`)
//! - The built-in default, which describes the solar project pipeline
//!
//! Validation (duplicate steps, empty pipelines) happens in
//! `solstice-workflow`, not here.

mod pipeline;
mod policy;
mod queue;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use pipeline::PipelineDef;
pub use policy::EnginePolicy;
pub use queue::QueueRouteDef;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}': {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolsticeConfig {
  #[serde(default)]
  pub policy: EnginePolicy,
  pub pipelines: Vec<PipelineDef>,
  /// Explicit dead-letter routes. When empty, one route per pipeline step is
  /// derived with [`QueueRouteDef::for_step`].
  #[serde(default)]
  pub queues: Vec<QueueRouteDef>,
}

impl SolsticeConfig {
  /// Parse a configuration document from JSON.
  pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(content)?)
  }

  /// Read and parse a configuration file.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.display().to_string(),
      source,
    })?;
    Self::from_json_str(&content)
  }

  /// The configured dead-letter routes, deriving per-step routes when none
  /// are listed explicitly.
  pub fn queue_routes(&self) -> Vec<QueueRouteDef> {
    if !self.queues.is_empty() {
      return self.queues.clone();
    }

    let mut routes: Vec<QueueRouteDef> = Vec::new();
    for pipeline in &self.pipelines {
      for step in &pipeline.steps {
        if routes.iter().all(|r| &r.step_name != step) {
          routes.push(QueueRouteDef::for_step(step));
        }
      }
    }
    routes
  }
}

impl Default for SolsticeConfig {
  fn default() -> Self {
    Self {
      policy: EnginePolicy::default(),
      pipelines: vec![
        PipelineDef::new(
          "solar_project",
          ["research", "design", "permitting", "financing"],
        ),
        PipelineDef::new("helioscope_processing", ["fetch", "analyze", "generate"]),
      ],
      queues: Vec::new(),
    }
  }
}
