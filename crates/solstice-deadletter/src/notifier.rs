//! Failure records and notifiers for external monitoring.
//!
//! Every absorbed message produces exactly one [`FailureRecord`], whether or
//! not the payload could be stored or the run updated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solstice_transition::TransitionOutcome;
use tokio::sync::mpsc;
use tracing::error;

/// Summary of one dead-letter absorption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
  pub message_id: String,
  pub failure_type: String,
  pub source_queue: String,
  pub project_id: Option<String>,
  pub run_id: Option<String>,
  /// Where the raw payload was stored, if storing it succeeded.
  pub blob_locator: Option<String>,
  /// The step marked failed, if a route for the failure type exists.
  pub step_name: Option<String>,
  /// Result of the state update, if one was attempted and returned.
  pub transition: Option<TransitionOutcome>,
  pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
  /// Whether this absorption changed run state.
  pub fn state_updated(&self) -> bool {
    self.transition.is_some_and(TransitionOutcome::is_applied)
  }
}

/// Trait for receiving failure records.
///
/// Implementations decide what to do with them (log, forward to an alerting
/// pipeline, collect in tests). `notify` must not panic.
pub trait FailureNotifier: Send + Sync {
  fn notify(&self, record: &FailureRecord);
}

/// Emits each record as a structured `error` event on the
/// `solstice::dead_letter` target.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl FailureNotifier for LogNotifier {
  fn notify(&self, record: &FailureRecord) {
    error!(
      target: "solstice::dead_letter",
      message_id = %record.message_id,
      failure_type = %record.failure_type,
      source_queue = %record.source_queue,
      project_id = record.project_id.as_deref().unwrap_or("-"),
      run_id = record.run_id.as_deref().unwrap_or("-"),
      blob_locator = record.blob_locator.as_deref().unwrap_or("-"),
      step = record.step_name.as_deref().unwrap_or("-"),
      state_updated = record.state_updated(),
      "dead_letter_absorbed"
    );
  }
}

/// A notifier that discards all records.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl FailureNotifier for NoopNotifier {
  fn notify(&self, _record: &FailureRecord) {}
}

/// A notifier that forwards records to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<FailureRecord>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<FailureRecord>) -> Self {
    Self { sender }
  }
}

impl FailureNotifier for ChannelNotifier {
  fn notify(&self, record: &FailureRecord) {
    // Receiver may have been dropped.
    let _ = self.sender.send(record.clone());
  }
}
