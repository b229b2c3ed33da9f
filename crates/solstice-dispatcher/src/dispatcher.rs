use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use solstice_config::EnginePolicy;
use solstice_store::{StepStatus, WorkflowRun};
use solstice_transition::StepTransitionEngine;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, instrument, warn};

use crate::error::DispatchError;
use crate::handler::{HandlerError, HandlerRegistry, StepContext, StepHandler};
use crate::message::TriggerMessage;
use crate::sink::TriggerSink;

/// What a dispatched trigger led to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DispatchOutcome {
  /// The step was already claimed or finished; the trigger was dropped.
  Duplicate,
  /// The step completed and the trigger for `next_step` was emitted.
  Advanced { next_step: String },
  /// The step completed and was the last of its pipeline.
  Finished,
  /// The step was marked failed.
  Failed { error: String },
}

/// Routes triggers to step handlers and records what they did.
///
/// Handlers run on their own task so a panic is contained and reported as a
/// step failure. Engine errors are returned to the caller, which is expected
/// to redeliver the trigger.
#[derive(Clone)]
pub struct Dispatcher {
  engine: StepTransitionEngine,
  handlers: Arc<HandlerRegistry>,
  sink: Arc<dyn TriggerSink>,
  handler_timeout: Option<Duration>,
}

impl Dispatcher {
  pub fn new(
    engine: StepTransitionEngine,
    handlers: Arc<HandlerRegistry>,
    sink: Arc<dyn TriggerSink>,
    policy: &EnginePolicy,
  ) -> Self {
    Self {
      engine,
      handlers,
      sink,
      handler_timeout: policy.handler_timeout_ms.map(Duration::from_millis),
    }
  }

  pub fn engine(&self) -> &StepTransitionEngine {
    &self.engine
  }

  /// Process one trigger.
  #[instrument(
    name = "dispatch",
    skip(self, message),
    fields(
      message_id = %message.message_id,
      project_id = %message.project_id,
      run_id = %message.run_id,
      step = %message.step_name,
      delivery_count = message.delivery_count,
    )
  )]
  pub async fn dispatch(&self, message: &TriggerMessage) -> Result<DispatchOutcome, DispatchError> {
    let claim = self
      .engine
      .claim_step(&message.project_id, &message.run_id, &message.step_name)
      .await?;

    if !claim.outcome.is_applied() {
      info!(outcome = ?claim.outcome, "duplicate trigger dropped");
      return Ok(DispatchOutcome::Duplicate);
    }

    let Some(handler) = self.handlers.get(&message.step_name) else {
      let error = format!("no handler registered for step '{}'", message.step_name);
      return self.fail(message, error).await;
    };

    let ctx = StepContext {
      message_id: message.message_id.clone(),
      project_id: message.project_id.clone(),
      run_id: message.run_id.clone(),
      step_name: message.step_name.clone(),
      payload: message.payload.clone(),
      results: claim.run.results.clone(),
    };

    match self.run_handler(handler, ctx).await {
      Ok(output) => self.complete(message, &claim.run, output).await,
      Err(e) => self.fail(message, e.message().to_string()).await,
    }
  }

  async fn run_handler(
    &self,
    handler: Arc<dyn StepHandler>,
    ctx: StepContext,
  ) -> Result<serde_json::Value, HandlerError> {
    let step = ctx.step_name.clone();
    // Aborted if this dispatch is dropped before the handler finishes.
    let mut task =
      AbortOnDropHandle::new(tokio::spawn(async move { handler.handle(&ctx).await }));

    let joined = match self.handler_timeout {
      Some(limit) => match tokio::time::timeout(limit, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
          task.abort();
          return Err(HandlerError::new(format!(
            "handler for step '{}' timed out after {}ms",
            step,
            limit.as_millis()
          )));
        }
      },
      None => task.await,
    };

    match joined {
      Ok(result) => result,
      Err(e) if e.is_panic() => Err(HandlerError::new(format!(
        "handler for step '{}' panicked",
        step
      ))),
      Err(e) => Err(HandlerError::new(format!(
        "handler for step '{}' did not finish: {}",
        step, e
      ))),
    }
  }

  async fn complete(
    &self,
    message: &TriggerMessage,
    claimed: &WorkflowRun,
    output: serde_json::Value,
  ) -> Result<DispatchOutcome, DispatchError> {
    let outcome = self
      .engine
      .update_step_status(
        &message.project_id,
        &message.run_id,
        &message.step_name,
        StepStatus::Completed,
        Some(output.clone()),
        None,
      )
      .await?;

    // Someone else finished the step while the handler ran.
    if !outcome.is_applied() {
      warn!(?outcome, "step completion not applied, not advancing");
      return Ok(DispatchOutcome::Duplicate);
    }

    let pipeline = self.engine.pipeline_for(claimed)?;
    match pipeline.next_step(&message.step_name) {
      Some(next_step) => {
        self.sink.emit(message.for_step(next_step, output)).await?;
        info!(next_step, "step completed, pipeline advanced");
        Ok(DispatchOutcome::Advanced {
          next_step: next_step.to_string(),
        })
      }
      None => {
        info!("step completed, pipeline finished");
        Ok(DispatchOutcome::Finished)
      }
    }
  }

  async fn fail(
    &self,
    message: &TriggerMessage,
    error: String,
  ) -> Result<DispatchOutcome, DispatchError> {
    let outcome = self
      .engine
      .update_step_status(
        &message.project_id,
        &message.run_id,
        &message.step_name,
        StepStatus::Failed,
        None,
        Some(error.clone()),
      )
      .await?;

    warn!(error, ?outcome, "step failed");
    Ok(DispatchOutcome::Failed { error })
  }
}
