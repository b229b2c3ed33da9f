use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::debug;

use crate::{
  CreateOutcome, RunStatus, RunStore, StepRecord, StoreError, VersionToken, WorkflowRun,
};

/// A workflow run row as stored in the database.
#[derive(Debug, FromRow)]
struct RunRow {
  project_id: String,
  run_id: String,
  workflow_type: String,
  run_status: RunStatus,
  current_step: Option<String>,
  last_update: DateTime<Utc>,
  error_details: Option<String>,
  results: Json<BTreeMap<String, serde_json::Value>>,
  steps: Json<Vec<StepRecord>>,
  version: i64,
}

impl From<RunRow> for WorkflowRun {
  fn from(row: RunRow) -> Self {
    Self {
      project_id: row.project_id,
      run_id: row.run_id,
      workflow_type: row.workflow_type,
      run_status: row.run_status,
      current_step: row.current_step,
      last_update: row.last_update,
      error_details: row.error_details,
      results: row.results.0,
      steps: row.steps.0,
      version: VersionToken::new(row.version.to_string()),
    }
  }
}

/// SQLite-based run store implementation.
///
/// The version token is the row's integer `version` column; a conditional
/// update only matches the row while that column still holds the expected
/// value, and bumps it in the same statement.
pub struct SqliteRunStore {
  pool: SqlitePool,
}

impl SqliteRunStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) the database at `url` and run migrations.
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store
      .migrate()
      .await
      .map_err(|e| StoreError::Database(e.into()))?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  async fn fetch(&self, project_id: &str, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
    let row: Option<RunRow> = sqlx::query_as(
      r#"
      SELECT project_id, run_id, workflow_type, run_status, current_step, last_update,
             error_details, results, steps, version
      FROM workflow_runs
      WHERE project_id = ? AND run_id = ?
      "#,
    )
    .bind(project_id)
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(WorkflowRun::from))
  }
}

#[async_trait]
impl RunStore for SqliteRunStore {
  async fn create(&self, run: &WorkflowRun) -> Result<CreateOutcome, StoreError> {
    let inserted = sqlx::query(
      r#"
      INSERT INTO workflow_runs (project_id, run_id, workflow_type, run_status, current_step,
                                 last_update, error_details, results, steps, version)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
      ON CONFLICT (project_id, run_id) DO NOTHING
      "#,
    )
    .bind(&run.project_id)
    .bind(&run.run_id)
    .bind(&run.workflow_type)
    .bind(run.run_status)
    .bind(&run.current_step)
    .bind(run.last_update)
    .bind(&run.error_details)
    .bind(Json(&run.results))
    .bind(Json(&run.steps))
    .execute(&self.pool)
    .await?
    .rows_affected();

    if inserted == 1 {
      let mut created = run.clone();
      created.version = VersionToken::new("1");
      return Ok(CreateOutcome::Created(created));
    }

    debug!(
      project_id = %run.project_id,
      run_id = %run.run_id,
      "run already exists, returning stored record"
    );
    let existing = self
      .fetch(&run.project_id, &run.run_id)
      .await?
      .ok_or_else(|| StoreError::not_found(&run.project_id, &run.run_id))?;
    Ok(CreateOutcome::AlreadyExists(existing))
  }

  async fn get(&self, project_id: &str, run_id: &str) -> Result<WorkflowRun, StoreError> {
    self
      .fetch(project_id, run_id)
      .await?
      .ok_or_else(|| StoreError::not_found(project_id, run_id))
  }

  async fn conditional_update(
    &self,
    run: &WorkflowRun,
    expected: &VersionToken,
  ) -> Result<WorkflowRun, StoreError> {
    // A token this backend never issued can never match.
    let Ok(expected_version) = expected.as_str().parse::<i64>() else {
      return Err(StoreError::conflict(run, expected));
    };

    let updated = sqlx::query(
      r#"
      UPDATE workflow_runs
      SET run_status = ?, current_step = ?, last_update = ?, error_details = ?,
          results = ?, steps = ?, version = version + 1
      WHERE project_id = ? AND run_id = ? AND version = ?
      "#,
    )
    .bind(run.run_status)
    .bind(&run.current_step)
    .bind(run.last_update)
    .bind(&run.error_details)
    .bind(Json(&run.results))
    .bind(Json(&run.steps))
    .bind(&run.project_id)
    .bind(&run.run_id)
    .bind(expected_version)
    .execute(&self.pool)
    .await?
    .rows_affected();

    if updated == 0 {
      // Distinguish a vanished row from a stale token.
      return match self.fetch(&run.project_id, &run.run_id).await? {
        Some(_) => Err(StoreError::conflict(run, expected)),
        None => Err(StoreError::not_found(&run.project_id, &run.run_id)),
      };
    }

    let mut stored = run.clone();
    stored.version = VersionToken::new((expected_version + 1).to_string());
    Ok(stored)
  }

  async fn list_runs(&self, project_id: &str) -> Result<Vec<WorkflowRun>, StoreError> {
    let rows: Vec<RunRow> = sqlx::query_as(
      r#"
      SELECT project_id, run_id, workflow_type, run_status, current_step, last_update,
             error_details, results, steps, version
      FROM workflow_runs
      WHERE project_id = ?
      ORDER BY last_update DESC
      "#,
    )
    .bind(project_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(WorkflowRun::from).collect())
  }
}
