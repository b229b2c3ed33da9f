//! Dispatch runner with channel-based triggering.
//!
//! The `DispatchRunner` owns an mpsc channel of [`TriggerMessage`]s and
//! dispatches each one on its own task. Triggers whose dispatch fails are
//! redelivered until they reach the poison threshold, then handed to the
//! dead-letter router.

use std::sync::Arc;
use std::time::Duration;

use solstice_config::EnginePolicy;
use solstice_deadletter::DeadLetterRouter;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::message::TriggerMessage;
use crate::sink::ChannelTriggerSink;

const DEFAULT_BUFFER_SIZE: usize = 100;
const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(50);

/// A runner that dispatches triggers until cancelled.
///
/// # Usage
///
/// ```ignore
/// let runner = DispatchRunner::new(dispatcher, dead_letters, &config.policy);
///
/// // Handlers' next-step triggers and external triggers share the channel
/// let sink = runner.trigger_sink();
/// runner.submit(TriggerMessage::new("P1", "R1", "fetch", payload)).await?;
///
/// let cancel = CancellationToken::new();
/// runner.start(cancel).await?;
/// ```
pub struct DispatchRunner {
  sender: mpsc::Sender<TriggerMessage>,
  receiver: mpsc::Receiver<TriggerMessage>,
  dispatcher: Arc<Dispatcher>,
  dead_letters: Arc<DeadLetterRouter>,
  max_delivery_count: u32,
  redelivery_delay: Duration,
}

impl DispatchRunner {
  /// Create a new dispatch runner.
  ///
  /// # Arguments
  /// * `dispatcher` - Dispatches each received trigger
  /// * `dead_letters` - Receives triggers that reached the poison threshold
  /// * `policy` - Poison threshold (`max_delivery_count`)
  pub fn new(
    dispatcher: Arc<Dispatcher>,
    dead_letters: Arc<DeadLetterRouter>,
    policy: &EnginePolicy,
  ) -> Self {
    Self::with_channel(
      mpsc::channel(DEFAULT_BUFFER_SIZE),
      dispatcher,
      dead_letters,
      policy,
    )
  }

  /// Create a runner over an existing channel.
  ///
  /// The dispatcher usually emits next-step triggers into the same channel,
  /// so build the channel first, hand a [`ChannelTriggerSink`] over its
  /// sender to the dispatcher, then pass both halves here.
  pub fn with_channel(
    (sender, receiver): (mpsc::Sender<TriggerMessage>, mpsc::Receiver<TriggerMessage>),
    dispatcher: Arc<Dispatcher>,
    dead_letters: Arc<DeadLetterRouter>,
    policy: &EnginePolicy,
  ) -> Self {
    Self {
      sender,
      receiver,
      dispatcher,
      dead_letters,
      max_delivery_count: policy.max_delivery_count.max(1),
      redelivery_delay: DEFAULT_REDELIVERY_DELAY,
    }
  }

  /// Wait this long before each redelivery.
  pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
    self.redelivery_delay = delay;
    self
  }

  /// Get a sender handle for submitting triggers.
  pub fn sender(&self) -> mpsc::Sender<TriggerMessage> {
    self.sender.clone()
  }

  /// A trigger sink that feeds this runner.
  pub fn trigger_sink(&self) -> ChannelTriggerSink {
    ChannelTriggerSink::new(self.sender())
  }

  /// Queue a trigger for dispatch.
  pub async fn submit(&self, message: TriggerMessage) -> Result<(), DispatchError> {
    self
      .sender
      .send(message)
      .await
      .map_err(|_| DispatchError::ChannelClosed)
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }

  /// Start the dispatch loop.
  ///
  /// Runs until the cancellation token is triggered or every sender handed
  /// out by this runner (including trigger sinks) has been dropped. The
  /// runner keeps only a weak handle for redeliveries, so it never holds
  /// its own channel open.
  ///
  /// In-flight dispatches are aborted on cancellation; their steps stay
  /// Processing. When the channel closes they are allowed to finish.
  pub async fn start(self, cancel: CancellationToken) -> Result<(), DispatchError> {
    info!(
      max_delivery_count = self.max_delivery_count,
      "starting dispatch runner"
    );

    let DispatchRunner {
      sender,
      mut receiver,
      dispatcher,
      dead_letters,
      max_delivery_count,
      redelivery_delay,
    } = self;
    let redeliver = sender.downgrade();
    drop(sender);

    let mut in_flight = JoinSet::new();
    let mut cancelled = false;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!(in_flight = in_flight.len(), "dispatch runner cancelled");
          cancelled = true;
          break;
        }
        Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
          if let Err(e) = joined {
            error!(error = %e, "dispatch task did not finish");
          }
        }
        message = receiver.recv() => {
          match message {
            Some(message) => {
              let delivery = Delivery {
                dispatcher: dispatcher.clone(),
                dead_letters: dead_letters.clone(),
                redeliver: redeliver.clone(),
                max_delivery_count,
                redelivery_delay,
              };
              in_flight.spawn(delivery.run(message));
            }
            None => {
              info!("dispatch runner channel closed");
              break;
            }
          }
        }
      }
    }

    if cancelled {
      in_flight.shutdown().await;
    } else {
      while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
          error!(error = %e, "dispatch task did not finish");
        }
      }
    }
    Ok(())
  }
}

/// One trigger's trip through the dispatcher.
struct Delivery {
  dispatcher: Arc<Dispatcher>,
  dead_letters: Arc<DeadLetterRouter>,
  redeliver: mpsc::WeakSender<TriggerMessage>,
  max_delivery_count: u32,
  redelivery_delay: Duration,
}

impl Delivery {
  async fn run(self, message: TriggerMessage) {
    let error = match self.dispatcher.dispatch(&message).await {
      Ok(outcome) => {
        info!(
          message_id = %message.message_id,
          step = %message.step_name,
          ?outcome,
          "trigger dispatched"
        );
        return;
      }
      Err(e) => e,
    };

    let message = message.redelivered();
    if message.delivery_count >= self.max_delivery_count {
      error!(
        message_id = %message.message_id,
        project_id = %message.project_id,
        run_id = %message.run_id,
        step = %message.step_name,
        delivery_count = message.delivery_count,
        error = %error,
        "delivery attempts exhausted, dead-lettering trigger"
      );
      self.dead_letter(&message).await;
      return;
    }

    warn!(
      message_id = %message.message_id,
      step = %message.step_name,
      delivery_count = message.delivery_count,
      error = %error,
      "dispatch failed, redelivering"
    );
    tokio::time::sleep(self.redelivery_delay).await;
    let sent = match self.redeliver.upgrade() {
      Some(sender) => sender.send(message).await.is_ok(),
      None => false,
    };
    if !sent {
      error!("dispatch runner channel closed, redelivery dropped");
    }
  }

  async fn dead_letter(&self, message: &TriggerMessage) {
    let body = match serde_json::to_vec(message) {
      Ok(body) => body,
      Err(e) => {
        error!(message_id = %message.message_id, error = %e, "failed to serialize trigger");
        Vec::new()
      }
    };

    let queue_name = self
      .dead_letters
      .queue_for_step(&message.step_name)
      .map(str::to_string)
      .unwrap_or_else(|| format!("{}-queue", message.step_name));

    self
      .dead_letters
      .route(&queue_name, &body, &message.message_id)
      .await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handler::HandlerRegistry;
  use crate::sink::NoopTriggerSink;
  use serde_json::json;
  use solstice_blob::InMemoryBlobSink;
  use solstice_config::SolsticeConfig;
  use solstice_deadletter::{DeadLetterAbsorber, NoopNotifier, QueueRoutes};
  use solstice_store::InMemoryRunStore;
  use solstice_transition::StepTransitionEngine;
  use solstice_workflow::PipelineSet;

  fn create_test_runner() -> DispatchRunner {
    create_test_runner_with_channel(mpsc::channel(DEFAULT_BUFFER_SIZE))
  }

  fn create_test_runner_with_channel(
    channel: (mpsc::Sender<TriggerMessage>, mpsc::Receiver<TriggerMessage>),
  ) -> DispatchRunner {
    let config = SolsticeConfig::default();
    let pipelines = Arc::new(PipelineSet::from_config(&config).unwrap());
    let engine =
      StepTransitionEngine::new(Arc::new(InMemoryRunStore::new()), pipelines, &config.policy);
    let dispatcher = Dispatcher::new(
      engine.clone(),
      Arc::new(HandlerRegistry::new()),
      Arc::new(NoopTriggerSink),
      &config.policy,
    );
    let absorber = DeadLetterAbsorber::new(
      Arc::new(InMemoryBlobSink::new()),
      engine,
      QueueRoutes::from_config(&config),
      Arc::new(NoopNotifier),
    );
    DispatchRunner::with_channel(
      channel,
      Arc::new(dispatcher),
      Arc::new(DeadLetterRouter::new(Arc::new(absorber))),
      &config.policy,
    )
    .with_redelivery_delay(Duration::from_millis(1))
  }

  #[tokio::test]
  async fn test_runner_creation() {
    let runner = create_test_runner();
    assert_eq!(runner.max_delivery_count, 5);
    assert_eq!(runner.redelivery_delay, Duration::from_millis(1));
  }

  #[tokio::test]
  async fn test_sender_cloning() {
    let runner = create_test_runner();

    let sender1 = runner.sender();
    let sender2 = runner.sender();

    assert!(!sender1.is_closed());
    assert!(!sender2.is_closed());
  }

  #[tokio::test]
  async fn test_submit_sends_to_channel() {
    let mut runner = create_test_runner();

    runner
      .submit(TriggerMessage::new("P1", "R1", "fetch", json!({"test": "data"})))
      .await
      .unwrap();

    let received = runner.receiver.recv().await.unwrap();
    assert_eq!(received.step_name, "fetch");
    assert_eq!(received.payload["test"], "data");
  }

  #[tokio::test]
  async fn test_cancellation() {
    let runner = create_test_runner();

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    let handle = tokio::spawn(async move { runner.start(cancel_clone).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let result = handle.await.unwrap();
    assert!(result.is_ok());
  }

  #[tokio::test]
  async fn test_stops_when_senders_dropped() {
    let (sender, receiver) = mpsc::channel(8);
    let runner = create_test_runner_with_channel((sender.clone(), receiver));

    sender
      .send(TriggerMessage::new("P1", "R1", "fetch", json!({})))
      .await
      .unwrap();
    drop(sender);

    let result = tokio::time::timeout(
      Duration::from_secs(5),
      runner.start(CancellationToken::new()),
    )
    .await
    .expect("runner should stop once its channel closes");
    assert!(result.is_ok());
  }
}
