use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::{CreateOutcome, RunStore, StoreError, VersionToken, WorkflowRun};

type RunKey = (String, String);

/// In-memory run store.
///
/// The version token is a per-run sequence number. The lock is held only for
/// the duration of a single operation. Can be switched unavailable to
/// simulate an unreachable backend.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
  runs: RwLock<HashMap<RunKey, (u64, WorkflowRun)>>,
  unavailable: AtomicBool,
}

impl InMemoryRunStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent call fail with [`StoreError::Unavailable`].
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  fn check_available(&self) -> Result<(), StoreError> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable(
        "in-memory store is offline".to_string(),
      ));
    }
    Ok(())
  }

  fn key(project_id: &str, run_id: &str) -> RunKey {
    (project_id.to_string(), run_id.to_string())
  }
}

fn stamp(run: &WorkflowRun, version: u64) -> WorkflowRun {
  let mut stored = run.clone();
  stored.version = VersionToken::new(version.to_string());
  stored
}

#[async_trait]
impl RunStore for InMemoryRunStore {
  async fn create(&self, run: &WorkflowRun) -> Result<CreateOutcome, StoreError> {
    self.check_available()?;
    let mut runs = self.runs.write().map_err(|_| StoreError::LockPoisoned)?;

    let key = Self::key(&run.project_id, &run.run_id);
    if let Some((_, existing)) = runs.get(&key) {
      return Ok(CreateOutcome::AlreadyExists(existing.clone()));
    }

    let stored = stamp(run, 1);
    runs.insert(key, (1, stored.clone()));
    Ok(CreateOutcome::Created(stored))
  }

  async fn get(&self, project_id: &str, run_id: &str) -> Result<WorkflowRun, StoreError> {
    self.check_available()?;
    let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;

    runs
      .get(&Self::key(project_id, run_id))
      .map(|(_, run)| run.clone())
      .ok_or_else(|| StoreError::not_found(project_id, run_id))
  }

  async fn conditional_update(
    &self,
    run: &WorkflowRun,
    expected: &VersionToken,
  ) -> Result<WorkflowRun, StoreError> {
    self.check_available()?;
    let mut runs = self.runs.write().map_err(|_| StoreError::LockPoisoned)?;

    let key = Self::key(&run.project_id, &run.run_id);
    let (version, _) = runs
      .get(&key)
      .ok_or_else(|| StoreError::not_found(&run.project_id, &run.run_id))?;

    if version.to_string() != expected.as_str() {
      return Err(StoreError::conflict(run, expected));
    }

    let next = version + 1;
    let stored = stamp(run, next);
    runs.insert(key, (next, stored.clone()));
    Ok(stored)
  }

  async fn list_runs(&self, project_id: &str) -> Result<Vec<WorkflowRun>, StoreError> {
    self.check_available()?;
    let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;

    let mut listed: Vec<WorkflowRun> = runs
      .values()
      .filter(|(_, run)| run.project_id == project_id)
      .map(|(_, run)| run.clone())
      .collect();
    listed.sort_by(|a, b| b.last_update.cmp(&a.last_update));
    Ok(listed)
  }
}
