//! The step transition engine.

use std::sync::Arc;

use chrono::Utc;
use solstice_config::EnginePolicy;
use solstice_store::{RunStore, StepStatus, StoreError, WorkflowRun};
use solstice_workflow::{Pipeline, PipelineSet};
use tracing::{debug, info, instrument, warn};

use crate::error::TransitionError;
use crate::plan::{Plan, StepChange, TransitionOutcome, plan_transition};

/// The outcome of a step change together with the run it was decided on.
///
/// For [`TransitionOutcome::Applied`] the run is the freshly written
/// revision; for skips it is the revision that caused the skip.
#[derive(Debug, Clone)]
pub struct Transition {
  pub outcome: TransitionOutcome,
  pub run: WorkflowRun,
  /// Number of read-plan-write attempts used.
  pub attempts: u32,
}

/// Applies step status changes to runs under optimistic concurrency.
///
/// Every mutation reads the run, plans the change with
/// [`plan_transition`], and writes it back with the token it read. Lost races
/// re-read and re-plan, up to `max_conflict_retries` attempts.
#[derive(Clone)]
pub struct StepTransitionEngine {
  store: Arc<dyn RunStore>,
  pipelines: Arc<PipelineSet>,
  max_attempts: u32,
}

impl StepTransitionEngine {
  /// Create a new engine.
  ///
  /// # Arguments
  /// * `store` - Run store all state flows through
  /// * `pipelines` - Known pipelines, used to create runs
  /// * `policy` - Conflict retry budget
  pub fn new(store: Arc<dyn RunStore>, pipelines: Arc<PipelineSet>, policy: &EnginePolicy) -> Self {
    Self {
      store,
      pipelines,
      max_attempts: policy.max_conflict_retries.max(1),
    }
  }

  pub fn pipelines(&self) -> &PipelineSet {
    &self.pipelines
  }

  /// Look up the pipeline a run follows.
  pub fn pipeline_for(&self, run: &WorkflowRun) -> Result<&Pipeline, TransitionError> {
    Ok(self.pipelines.get(&run.workflow_type)?)
  }

  /// Create a run with every step pending.
  ///
  /// Idempotent: if the run already exists it is returned unchanged.
  #[instrument(skip(self))]
  pub async fn create_workflow_run(
    &self,
    project_id: &str,
    run_id: &str,
    workflow_type: &str,
  ) -> Result<WorkflowRun, TransitionError> {
    let pipeline = self.pipelines.get(workflow_type)?;
    let run = WorkflowRun::new(
      project_id,
      run_id,
      workflow_type,
      pipeline.steps().iter().cloned(),
      Utc::now(),
    );

    let outcome = self.store.create(&run).await?;
    if outcome.was_created() {
      info!(project_id, run_id, workflow_type, "workflow_run_created");
    } else {
      debug!(project_id, run_id, "workflow run already exists");
    }
    Ok(outcome.into_run())
  }

  /// Read the current state of a run.
  pub async fn get_workflow_state(
    &self,
    project_id: &str,
    run_id: &str,
  ) -> Result<WorkflowRun, TransitionError> {
    Ok(self.store.get(project_id, run_id).await?)
  }

  /// List the runs of a project, most recently updated first.
  pub async fn list_runs(&self, project_id: &str) -> Result<Vec<WorkflowRun>, TransitionError> {
    Ok(self.store.list_runs(project_id).await?)
  }

  /// Change the status of one step.
  ///
  /// `output` is kept when the step completes and `error_details` when it
  /// fails.
  pub async fn update_step_status(
    &self,
    project_id: &str,
    run_id: &str,
    step_name: &str,
    status: StepStatus,
    output: Option<serde_json::Value>,
    error_details: Option<String>,
  ) -> Result<TransitionOutcome, TransitionError> {
    let change = StepChange {
      step_name: step_name.to_string(),
      status,
      output,
      error_details,
    };
    Ok(self.apply(project_id, run_id, change).await?.outcome)
  }

  /// Claim a step before doing its work.
  ///
  /// Returns `true` only when this call moved the step into Processing. A
  /// redelivered trigger for a step that is already claimed or finished gets
  /// `false` and must be dropped.
  pub async fn mark_step_processing_with_idempotency(
    &self,
    project_id: &str,
    run_id: &str,
    step_name: &str,
  ) -> Result<bool, TransitionError> {
    let transition = self.claim_step(project_id, run_id, step_name).await?;
    Ok(transition.outcome.is_applied())
  }

  /// Like [`mark_step_processing_with_idempotency`](Self::mark_step_processing_with_idempotency),
  /// but also returns the run the claim was decided on.
  pub async fn claim_step(
    &self,
    project_id: &str,
    run_id: &str,
    step_name: &str,
  ) -> Result<Transition, TransitionError> {
    self
      .apply(project_id, run_id, StepChange::processing(step_name))
      .await
  }

  /// Apply a step change, resolving version conflicts by re-reading.
  #[instrument(
    name = "step_transition",
    skip(self, change),
    fields(step = %change.step_name, status = %change.status)
  )]
  pub async fn apply(
    &self,
    project_id: &str,
    run_id: &str,
    change: StepChange,
  ) -> Result<Transition, TransitionError> {
    for attempt in 1..=self.max_attempts {
      let current = self.store.get(project_id, run_id).await?;

      let next = match plan_transition(&current, &change, Utc::now())? {
        Plan::Skip(outcome) => {
          debug!(
            project_id,
            run_id,
            step = %change.step_name,
            ?outcome,
            "step transition skipped"
          );
          return Ok(Transition {
            outcome,
            run: current,
            attempts: attempt,
          });
        }
        Plan::Apply(next) => next,
      };

      match self.store.conditional_update(&next, &current.version).await {
        Ok(stored) => {
          info!(
            project_id,
            run_id,
            step = %change.step_name,
            status = %change.status,
            run_status = ?stored.run_status,
            attempt,
            "step_transition_applied"
          );
          return Ok(Transition {
            outcome: TransitionOutcome::Applied,
            run: stored,
            attempts: attempt,
          });
        }
        Err(StoreError::VersionConflict { .. }) => {
          warn!(
            project_id,
            run_id,
            step = %change.step_name,
            attempt,
            max_attempts = self.max_attempts,
            "version conflict, re-reading run"
          );
        }
        Err(e) => return Err(e.into()),
      }
    }

    Err(TransitionError::ConflictRetriesExhausted {
      project_id: project_id.to_string(),
      run_id: run_id.to_string(),
      step: change.step_name,
      attempts: self.max_attempts,
    })
  }
}
