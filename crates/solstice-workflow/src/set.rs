use std::collections::HashMap;

use solstice_config::SolsticeConfig;

use crate::error::WorkflowError;
use crate::pipeline::Pipeline;

/// All known pipelines, keyed by workflow type.
#[derive(Debug, Clone, Default)]
pub struct PipelineSet {
  pipelines: HashMap<String, Pipeline>,
}

impl PipelineSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Validate every pipeline in the configuration.
  pub fn from_config(config: &SolsticeConfig) -> Result<Self, WorkflowError> {
    let mut set = Self::new();
    for def in &config.pipelines {
      set.insert(Pipeline::from_def(def)?)?;
    }
    Ok(set)
  }

  pub fn insert(&mut self, pipeline: Pipeline) -> Result<(), WorkflowError> {
    let workflow_type = pipeline.workflow_type().to_string();
    if self.pipelines.contains_key(&workflow_type) {
      return Err(WorkflowError::DuplicateWorkflowType(workflow_type));
    }
    self.pipelines.insert(workflow_type, pipeline);
    Ok(())
  }

  pub fn get(&self, workflow_type: &str) -> Result<&Pipeline, WorkflowError> {
    self
      .pipelines
      .get(workflow_type)
      .ok_or_else(|| WorkflowError::UnknownWorkflowType(workflow_type.to_string()))
  }

  /// Workflow types, sorted.
  pub fn workflow_types(&self) -> Vec<&str> {
    let mut types: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
    types.sort_unstable();
    types
  }
}
