use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
  #[error("pipeline '{0}' has no steps")]
  EmptyPipeline(String),

  #[error("pipeline '{workflow_type}' has a blank step name")]
  BlankStep { workflow_type: String },

  #[error("pipeline '{workflow_type}' lists step '{step}' more than once")]
  DuplicateStep { workflow_type: String, step: String },

  #[error("workflow type '{0}' is defined more than once")]
  DuplicateWorkflowType(String),

  #[error("unknown workflow type: {0}")]
  UnknownWorkflowType(String),
}
