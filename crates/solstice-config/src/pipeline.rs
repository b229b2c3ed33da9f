use serde::{Deserialize, Serialize};

/// A linear pipeline: the ordered step names run for a workflow type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
  pub workflow_type: String,
  pub steps: Vec<String>,
}

impl PipelineDef {
  pub fn new<I, S>(workflow_type: impl Into<String>, steps: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      workflow_type: workflow_type.into(),
      steps: steps.into_iter().map(Into::into).collect(),
    }
  }
}
