use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DispatchError;
use crate::message::TriggerMessage;

/// Where the dispatcher sends the trigger for the next step.
#[async_trait]
pub trait TriggerSink: Send + Sync {
  async fn emit(&self, message: TriggerMessage) -> Result<(), DispatchError>;
}

/// Sends triggers into an mpsc channel, usually a [`DispatchRunner`](crate::DispatchRunner)'s.
#[derive(Debug, Clone)]
pub struct ChannelTriggerSink {
  sender: mpsc::Sender<TriggerMessage>,
}

impl ChannelTriggerSink {
  pub fn new(sender: mpsc::Sender<TriggerMessage>) -> Self {
    Self { sender }
  }
}

#[async_trait]
impl TriggerSink for ChannelTriggerSink {
  async fn emit(&self, message: TriggerMessage) -> Result<(), DispatchError> {
    let step = message.step_name.clone();
    self
      .sender
      .send(message)
      .await
      .map_err(|_| DispatchError::Emit {
        step,
        message: "trigger channel closed".to_string(),
      })
  }
}

/// Drops every trigger.
#[derive(Debug, Clone, Default)]
pub struct NoopTriggerSink;

#[async_trait]
impl TriggerSink for NoopTriggerSink {
  async fn emit(&self, _message: TriggerMessage) -> Result<(), DispatchError> {
    Ok(())
  }
}
