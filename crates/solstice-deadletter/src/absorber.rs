use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use solstice_blob::{BlobSink, Locator};
use solstice_store::StepStatus;
use solstice_transition::{StepTransitionEngine, TransitionOutcome};
use tracing::{error, info, instrument, warn};

use crate::envelope::{DeadLetterEnvelope, RunIdentifiers, encode_payload, extract_identifiers};
use crate::notifier::{FailureNotifier, FailureRecord};
use crate::routes::QueueRoutes;

const ENVELOPE_CONTENT_TYPE: &str = "application/json";

/// What became of one absorbed message.
#[derive(Debug, Clone, PartialEq)]
pub enum AbsorptionReport {
  /// Absorption ran to the end. Individual steps may still have failed; the
  /// record says which ones succeeded.
  Absorbed(FailureRecord),
  /// A panic escaped absorption and the message was dropped.
  Discarded { message_id: String },
}

impl AbsorptionReport {
  pub fn record(&self) -> Option<&FailureRecord> {
    match self {
      AbsorptionReport::Absorbed(record) => Some(record),
      AbsorptionReport::Discarded { .. } => None,
    }
  }

  pub fn blob_locator(&self) -> Option<&str> {
    self.record()?.blob_locator.as_deref()
  }

  pub fn state_updated(&self) -> bool {
    self.record().is_some_and(FailureRecord::state_updated)
  }
}

/// Terminal handler for poison messages.
///
/// Stores the raw message in the blob sink, marks the owning step failed and
/// reports the failure. [`absorb`](Self::absorb) never returns an error and
/// never lets a panic escape; each stage is guarded on its own so a broken
/// blob sink does not prevent the state update and vice versa.
pub struct DeadLetterAbsorber {
  blob: Arc<dyn BlobSink>,
  engine: StepTransitionEngine,
  routes: QueueRoutes,
  notifier: Arc<dyn FailureNotifier>,
}

impl DeadLetterAbsorber {
  pub fn new(
    blob: Arc<dyn BlobSink>,
    engine: StepTransitionEngine,
    routes: QueueRoutes,
    notifier: Arc<dyn FailureNotifier>,
  ) -> Self {
    Self {
      blob,
      engine,
      routes,
      notifier,
    }
  }

  pub fn routes(&self) -> &QueueRoutes {
    &self.routes
  }

  /// Absorb one dead-lettered message.
  #[instrument(
    name = "dead_letter_absorb",
    skip(self, raw_payload),
    fields(bytes = raw_payload.len())
  )]
  pub async fn absorb(
    &self,
    failure_type: &str,
    raw_payload: &[u8],
    message_id: &str,
    source_queue: &str,
  ) -> AbsorptionReport {
    let guarded = AssertUnwindSafe(self.absorb_guarded(
      failure_type,
      raw_payload,
      message_id,
      source_queue,
    ))
    .catch_unwind()
    .await;

    match guarded {
      Ok(record) => AbsorptionReport::Absorbed(record),
      Err(panic) => {
        error!(
          critical = true,
          message_id,
          failure_type,
          source_queue,
          panic = %panic_message(panic.as_ref()),
          "dead-letter absorption panicked, message discarded"
        );
        AbsorptionReport::Discarded {
          message_id: message_id.to_string(),
        }
      }
    }
  }

  async fn absorb_guarded(
    &self,
    failure_type: &str,
    raw_payload: &[u8],
    message_id: &str,
    source_queue: &str,
  ) -> FailureRecord {
    let identifiers = match extract_identifiers(raw_payload) {
      Ok(ids) => ids,
      Err(e) => {
        warn!(
          message_id,
          error = %e,
          "dead-lettered payload is not a JSON object, storing blob only"
        );
        RunIdentifiers::default()
      }
    };

    let (payload_encoding, encoded_payload) = encode_payload(raw_payload);
    let envelope = DeadLetterEnvelope {
      message_id: message_id.to_string(),
      source_queue: source_queue.to_string(),
      failure_type: failure_type.to_string(),
      timestamp: Utc::now(),
      run_id: identifiers.run_id.clone(),
      project_id: identifiers.project_id.clone(),
      raw_payload: encoded_payload,
      payload_encoding,
    };

    let locator = guard_stage("store_payload", message_id, self.store_envelope(&envelope))
      .await
      .flatten();

    let (step_name, transition) = match identifiers.complete() {
      Some((project_id, run_id)) => {
        let failed = guard_stage(
          "fail_step",
          message_id,
          self.fail_step(project_id, run_id, &envelope, locator.as_ref()),
        )
        .await;
        failed.unwrap_or_else(|| {
          let step = self.routes.step_for_failure_type(failure_type);
          (step.map(str::to_string), None)
        })
      }
      None => {
        warn!(
          message_id,
          project_id = identifiers.project_id.as_deref().unwrap_or("-"),
          run_id = identifiers.run_id.as_deref().unwrap_or("-"),
          "run not identified, skipping state update"
        );
        (None, None)
      }
    };

    let record = FailureRecord {
      message_id: envelope.message_id,
      failure_type: envelope.failure_type,
      source_queue: envelope.source_queue,
      project_id: envelope.project_id,
      run_id: envelope.run_id,
      blob_locator: locator.map(|l| l.to_string()),
      step_name,
      transition,
      timestamp: envelope.timestamp,
    };
    let notifier = &self.notifier;
    guard_stage("notify", message_id, async { notifier.notify(&record) }).await;
    record
  }

  async fn store_envelope(&self, envelope: &DeadLetterEnvelope) -> Option<Locator> {
    let body = match serde_json::to_vec(envelope) {
      Ok(body) => Bytes::from(body),
      Err(e) => {
        error!(
          message_id = %envelope.message_id,
          error = %e,
          "failed to serialize dead-letter envelope"
        );
        return None;
      }
    };

    let key = envelope.blob_key();
    match self.blob.put(&key, body, ENVELOPE_CONTENT_TYPE).await {
      Ok(locator) => {
        info!(
          message_id = %envelope.message_id,
          locator = %locator,
          "stored dead-lettered payload"
        );
        Some(locator)
      }
      Err(e) => {
        error!(
          message_id = %envelope.message_id,
          key,
          error = %e,
          "failed to store dead-lettered payload"
        );
        None
      }
    }
  }

  async fn fail_step(
    &self,
    project_id: &str,
    run_id: &str,
    envelope: &DeadLetterEnvelope,
    locator: Option<&Locator>,
  ) -> (Option<String>, Option<TransitionOutcome>) {
    let Some(step) = self.routes.step_for_failure_type(&envelope.failure_type) else {
      error!(
        critical = true,
        project_id,
        run_id,
        message_id = %envelope.message_id,
        failure_type = %envelope.failure_type,
        source_queue = %envelope.source_queue,
        "no step registered for failure type, run state left unchanged"
      );
      return (None, None);
    };

    let error_details = match locator {
      Some(locator) => format!(
        "dead-lettered message {}; payload at {}",
        envelope.message_id, locator
      ),
      None => format!(
        "dead-lettered message {}; payload not stored",
        envelope.message_id
      ),
    };

    let outcome = self
      .engine
      .update_step_status(
        project_id,
        run_id,
        step,
        StepStatus::Failed,
        None,
        Some(error_details),
      )
      .await;

    match outcome {
      Ok(outcome) => {
        info!(project_id, run_id, step, ?outcome, "dead-lettered step marked failed");
        (Some(step.to_string()), Some(outcome))
      }
      Err(e) => {
        error!(
          project_id,
          run_id,
          step,
          error = %e,
          "failed to mark dead-lettered step failed"
        );
        (Some(step.to_string()), None)
      }
    }
  }
}

/// Run one absorption stage, turning a panic into `None`.
async fn guard_stage<F: Future>(stage: &str, message_id: &str, fut: F) -> Option<F::Output> {
  match AssertUnwindSafe(fut).catch_unwind().await {
    Ok(output) => Some(output),
    Err(panic) => {
      error!(
        critical = true,
        stage,
        message_id,
        panic = %panic_message(panic.as_ref()),
        "dead-letter absorption stage panicked"
      );
      None
    }
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.as_str()
  } else {
    "non-string panic payload"
  }
}
