//! Solstice Store
//!
//! This crate provides the storage trait and implementations for workflow
//! runs. Runs are persisted in memory (tests, single-process use) or in a
//! SQLite database.
//!
//! The [`RunStore`] trait defines:
//! - Idempotent run creation (a duplicate create returns the stored run)
//! - Point reads that return the current [`VersionToken`]
//! - Conditional updates that fail with [`StoreError::VersionConflict`] when
//!   the presented token is stale
//! - Listing runs of a project, for observability only

mod memory;
mod sqlite;
mod types;

pub use memory::InMemoryRunStore;
pub use sqlite::SqliteRunStore;
pub use types::{
  RunStatus, StepRecord, StepStatus, VersionToken, WorkflowRun, derive_run_status,
};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested run was not found.
  #[error("run not found: {project_id}/{run_id}")]
  NotFound { project_id: String, run_id: String },

  /// The presented version token no longer matches the stored one.
  #[error("version conflict on run {project_id}/{run_id}: expected version '{expected}'")]
  VersionConflict {
    project_id: String,
    run_id: String,
    expected: VersionToken,
  },

  /// The backend cannot be reached.
  #[error("run store unavailable: {0}")]
  Unavailable(String),

  /// Internal lock was poisoned by a panicked thread.
  #[error("run store lock poisoned")]
  LockPoisoned,

  /// A stored document could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

impl StoreError {
  pub(crate) fn not_found(project_id: &str, run_id: &str) -> Self {
    Self::NotFound {
      project_id: project_id.to_string(),
      run_id: run_id.to_string(),
    }
  }

  pub(crate) fn conflict(run: &WorkflowRun, expected: &VersionToken) -> Self {
    Self::VersionConflict {
      project_id: run.project_id.clone(),
      run_id: run.run_id.clone(),
      expected: expected.clone(),
    }
  }
}

/// Result of [`RunStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
  /// The run was inserted.
  Created(WorkflowRun),
  /// A run with the same key already existed; it is returned unchanged.
  AlreadyExists(WorkflowRun),
}

impl CreateOutcome {
  pub fn was_created(&self) -> bool {
    matches!(self, CreateOutcome::Created(_))
  }

  pub fn into_run(self) -> WorkflowRun {
    match self {
      CreateOutcome::Created(run) | CreateOutcome::AlreadyExists(run) => run,
    }
  }
}

/// Storage trait for workflow runs.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn RunStore>`.
#[async_trait]
pub trait RunStore: Send + Sync {
  /// Insert a run, or return the existing one if the key is taken.
  ///
  /// The version token of the passed run is ignored; the returned run
  /// carries the stored token.
  async fn create(&self, run: &WorkflowRun) -> Result<CreateOutcome, StoreError>;

  /// Get a run by project and run ID.
  async fn get(&self, project_id: &str, run_id: &str) -> Result<WorkflowRun, StoreError>;

  /// Replace a run if its stored token still equals `expected`.
  ///
  /// Returns the stored run with its new token.
  async fn conditional_update(
    &self,
    run: &WorkflowRun,
    expected: &VersionToken,
  ) -> Result<WorkflowRun, StoreError>;

  /// List runs for a project, most recently updated first.
  async fn list_runs(&self, project_id: &str) -> Result<Vec<WorkflowRun>, StoreError>;
}
