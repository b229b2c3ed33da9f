//! Pure transition planning.
//!
//! [`plan_transition`] decides what a requested step change does to a run
//! without touching storage, so the retry loop in the engine can re-plan
//! against every freshly read revision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solstice_store::{RunStatus, StepStatus, WorkflowRun};

use crate::error::TransitionError;

/// A requested change to one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepChange {
  pub step_name: String,
  pub status: StepStatus,
  /// Captured when the step completes.
  pub output: Option<serde_json::Value>,
  /// Recorded when the step fails.
  pub error_details: Option<String>,
}

impl StepChange {
  pub fn new(step_name: impl Into<String>, status: StepStatus) -> Self {
    Self {
      step_name: step_name.into(),
      status,
      output: None,
      error_details: None,
    }
  }

  pub fn processing(step_name: impl Into<String>) -> Self {
    Self::new(step_name, StepStatus::Processing)
  }

  pub fn completed(step_name: impl Into<String>, output: serde_json::Value) -> Self {
    Self {
      output: Some(output),
      ..Self::new(step_name, StepStatus::Completed)
    }
  }

  pub fn failed(step_name: impl Into<String>, error_details: impl Into<String>) -> Self {
    Self {
      error_details: Some(error_details.into()),
      ..Self::new(step_name, StepStatus::Failed)
    }
  }
}

/// What happened to a requested step change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
  /// The change was written.
  Applied,
  /// The step already had the requested status (or was already claimed);
  /// nothing was written.
  SkippedIdempotent,
  /// The step or run is terminal; nothing was written.
  SkippedTerminal,
}

impl TransitionOutcome {
  pub fn is_applied(self) -> bool {
    self == TransitionOutcome::Applied
  }
}

/// The decision for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
  /// Leave the run untouched.
  Skip(TransitionOutcome),
  /// Write this revision of the run.
  Apply(Box<WorkflowRun>),
}

/// Decide the effect of `change` on `run` at time `now`.
pub fn plan_transition(
  run: &WorkflowRun,
  change: &StepChange,
  now: DateTime<Utc>,
) -> Result<Plan, TransitionError> {
  let mut next = run.clone();
  let step = next
    .step_mut(&change.step_name)
    .ok_or_else(|| TransitionError::StepNotFound {
      project_id: run.project_id.clone(),
      run_id: run.run_id.clone(),
      step: change.step_name.clone(),
    })?;
  let current = step.status;

  // Replays of the current status are no-ops. This also covers a duplicate
  // Processing claim on a step that is already Processing.
  if current == change.status {
    return Ok(Plan::Skip(TransitionOutcome::SkippedIdempotent));
  }

  // Terminal steps never change. A late Processing claim on a Completed step
  // lands here as well.
  if current.is_terminal() {
    return Ok(Plan::Skip(TransitionOutcome::SkippedTerminal));
  }

  // A finished run is frozen even for steps that never left Pending.
  if run.run_status.is_terminal() {
    return Ok(Plan::Skip(TransitionOutcome::SkippedTerminal));
  }

  step.status = change.status;
  match change.status {
    StepStatus::Processing => {
      step.start_time = Some(now);
    }
    StepStatus::Completed => {
      step.end_time = Some(now);
      step.output = change.output.clone();
    }
    StepStatus::Failed => {
      step.end_time = Some(now);
      step.error = Some(
        change
          .error_details
          .clone()
          .unwrap_or_else(|| format!("step '{}' failed", change.step_name)),
      );
    }
    StepStatus::Pending => {}
  }
  let step_error = step.error.clone();

  if let (StepStatus::Completed, Some(output)) = (change.status, &change.output) {
    next
      .results
      .insert(change.step_name.clone(), output.clone());
  }

  next.current_step = Some(change.step_name.clone());
  next.last_update = now;
  next.refresh_status();

  if next.run_status == RunStatus::Failed {
    next.error_details = step_error;
  }

  Ok(Plan::Apply(Box::new(next)))
}
