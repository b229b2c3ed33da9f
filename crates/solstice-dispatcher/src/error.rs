use solstice_transition::TransitionError;

/// Errors that leave a trigger unprocessed.
///
/// Handler failures are not errors here: they are recorded on the step and
/// reported as [`DispatchOutcome::Failed`](crate::DispatchOutcome::Failed).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
  #[error(transparent)]
  Transition(#[from] TransitionError),

  #[error("failed to emit trigger for step '{step}': {message}")]
  Emit { step: String, message: String },

  #[error("dispatch runner channel closed")]
  ChannelClosed,
}
