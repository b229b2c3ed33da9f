use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse-grained status of a workflow run. Always derived from its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl RunStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, RunStatus::Completed | RunStatus::Failed)
  }
}

/// Status of a single pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl StepStatus {
  /// Completed and Failed steps never change again.
  pub fn is_terminal(self) -> bool {
    matches!(self, StepStatus::Completed | StepStatus::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      StepStatus::Pending => "pending",
      StepStatus::Processing => "processing",
      StepStatus::Completed => "completed",
      StepStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for StepStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Opaque optimistic-concurrency token.
///
/// Handed out by a [`RunStore`](crate::RunStore) on every read and required
/// back on every conditional write. Callers must not interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  /// The token of a run that has not been persisted yet.
  pub fn unset() -> Self {
    Self::default()
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for VersionToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// State of one named stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
  pub name: String,
  pub status: StepStatus,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  pub output: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl StepRecord {
  pub fn pending(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      status: StepStatus::Pending,
      start_time: None,
      end_time: None,
      output: None,
      error: None,
    }
  }
}

/// A workflow run as persisted in a run store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
  pub project_id: String,
  pub run_id: String,
  pub workflow_type: String,
  pub run_status: RunStatus,
  pub current_step: Option<String>,
  pub last_update: DateTime<Utc>,
  pub error_details: Option<String>,
  pub results: BTreeMap<String, serde_json::Value>,
  /// Steps in pipeline order. The set is fixed when the run is created.
  pub steps: Vec<StepRecord>,
  #[serde(rename = "versionToken")]
  pub version: VersionToken,
}

impl WorkflowRun {
  /// A fresh run with every step pending and no version token yet.
  pub fn new<I, S>(
    project_id: impl Into<String>,
    run_id: impl Into<String>,
    workflow_type: impl Into<String>,
    steps: I,
    now: DateTime<Utc>,
  ) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      project_id: project_id.into(),
      run_id: run_id.into(),
      workflow_type: workflow_type.into(),
      run_status: RunStatus::Pending,
      current_step: None,
      last_update: now,
      error_details: None,
      results: BTreeMap::new(),
      steps: steps.into_iter().map(StepRecord::pending).collect(),
      version: VersionToken::unset(),
    }
  }

  pub fn step(&self, name: &str) -> Option<&StepRecord> {
    self.steps.iter().find(|s| s.name == name)
  }

  pub fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
    self.steps.iter_mut().find(|s| s.name == name)
  }

  /// Recompute `run_status` from the steps.
  pub fn refresh_status(&mut self) {
    self.run_status = derive_run_status(self.steps.iter().map(|s| s.status));
  }
}

/// Derive the run status from step statuses.
///
/// Failed if any step failed, Completed only when every step completed,
/// Processing once any step has left Pending, Pending otherwise.
pub fn derive_run_status(statuses: impl IntoIterator<Item = StepStatus>) -> RunStatus {
  let mut any_started = false;
  let mut all_completed = true;
  let mut any = false;

  for status in statuses {
    any = true;
    match status {
      StepStatus::Failed => return RunStatus::Failed,
      StepStatus::Completed => any_started = true,
      StepStatus::Processing => {
        any_started = true;
        all_completed = false;
      }
      StepStatus::Pending => all_completed = false,
    }
  }

  if any && all_completed {
    RunStatus::Completed
  } else if any_started {
    RunStatus::Processing
  } else {
    RunStatus::Pending
  }
}
