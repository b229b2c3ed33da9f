use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use solstice_config::PipelineDef;

use crate::error::WorkflowError;

/// A validated linear pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
  workflow_type: String,
  steps: Vec<String>,
}

impl Pipeline {
  /// Build a pipeline, rejecting empty, blank or duplicated steps.
  pub fn new<I, S>(workflow_type: impl Into<String>, steps: I) -> Result<Self, WorkflowError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let workflow_type = workflow_type.into();
    let steps: Vec<String> = steps.into_iter().map(Into::into).collect();

    if steps.is_empty() {
      return Err(WorkflowError::EmptyPipeline(workflow_type));
    }

    let mut seen = HashSet::new();
    for step in &steps {
      if step.trim().is_empty() {
        return Err(WorkflowError::BlankStep { workflow_type });
      }
      if !seen.insert(step.as_str()) {
        return Err(WorkflowError::DuplicateStep {
          workflow_type,
          step: step.clone(),
        });
      }
    }

    Ok(Self {
      workflow_type,
      steps,
    })
  }

  pub fn from_def(def: &PipelineDef) -> Result<Self, WorkflowError> {
    Self::new(def.workflow_type.clone(), def.steps.iter().cloned())
  }

  pub fn workflow_type(&self) -> &str {
    &self.workflow_type
  }

  /// Step names in execution order.
  pub fn steps(&self) -> &[String] {
    &self.steps
  }

  pub fn first_step(&self) -> &str {
    // Non-empty is checked in `new`.
    &self.steps[0]
  }

  pub fn contains(&self, step: &str) -> bool {
    self.steps.iter().any(|s| s == step)
  }

  /// The step that follows `step`, or `None` for the last step or an
  /// unknown step.
  pub fn next_step(&self, step: &str) -> Option<&str> {
    let index = self.steps.iter().position(|s| s == step)?;
    self.steps.get(index + 1).map(String::as_str)
  }
}
