//! Transition engine errors.

use solstice_store::StoreError;
use solstice_workflow::WorkflowError;

/// Errors that can occur while changing run state.
///
/// Rejected transitions (idempotent replays, writes against terminal steps)
/// are not errors; they are reported as skip outcomes.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
  /// The run does not exist. Runs are never synthesized on demand.
  #[error("run '{project_id}/{run_id}' not found")]
  RunNotFound { project_id: String, run_id: String },

  /// The run exists but has no step with this name.
  #[error("step '{step}' not found in run '{project_id}/{run_id}'")]
  StepNotFound {
    project_id: String,
    run_id: String,
    step: String,
  },

  /// No pipeline is registered for the workflow type.
  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  /// Every attempt lost the race against a concurrent writer.
  #[error(
    "gave up updating step '{step}' of run '{project_id}/{run_id}' after {attempts} version conflicts"
  )]
  ConflictRetriesExhausted {
    project_id: String,
    run_id: String,
    step: String,
    attempts: u32,
  },

  /// The run store failed.
  #[error("run store error")]
  Store(#[source] StoreError),
}

impl From<StoreError> for TransitionError {
  fn from(error: StoreError) -> Self {
    match error {
      StoreError::NotFound { project_id, run_id } => Self::RunNotFound { project_id, run_id },
      other => Self::Store(other),
    }
  }
}
