use serde::{Deserialize, Serialize};

/// A request to run one step of one run.
///
/// This is the JSON body carried on step queues, and therefore also the body
/// the dead-letter absorber receives for poison triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessage {
  pub message_id: String,
  pub project_id: String,
  pub run_id: String,
  pub step_name: String,
  /// Input for the step; the previous step's output when emitted by the
  /// dispatcher.
  #[serde(default)]
  pub payload: serde_json::Value,
  /// Failed deliveries so far.
  #[serde(default)]
  pub delivery_count: u32,
}

impl TriggerMessage {
  pub fn new(
    project_id: impl Into<String>,
    run_id: impl Into<String>,
    step_name: impl Into<String>,
    payload: serde_json::Value,
  ) -> Self {
    Self {
      message_id: uuid::Uuid::new_v4().to_string(),
      project_id: project_id.into(),
      run_id: run_id.into(),
      step_name: step_name.into(),
      payload,
      delivery_count: 0,
    }
  }

  /// A fresh trigger for another step of the same run.
  pub fn for_step(&self, step_name: impl Into<String>, payload: serde_json::Value) -> Self {
    Self::new(self.project_id.clone(), self.run_id.clone(), step_name, payload)
  }

  /// The same message after one more failed delivery.
  pub fn redelivered(&self) -> Self {
    Self {
      delivery_count: self.delivery_count.saturating_add(1),
      ..self.clone()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_shape() {
    let message = TriggerMessage::new("P1", "R1", "fetch", json!({"url": "s3://x"}));
    let value = serde_json::to_value(&message).unwrap();

    assert_eq!(value["projectId"], "P1");
    assert_eq!(value["runId"], "R1");
    assert_eq!(value["stepName"], "fetch");
    assert_eq!(value["deliveryCount"], 0);
    assert_eq!(value["payload"]["url"], "s3://x");
  }

  #[test]
  fn test_defaults_when_parsing() {
    let message: TriggerMessage = serde_json::from_str(
      r#"{"messageId": "m1", "projectId": "P1", "runId": "R1", "stepName": "fetch"}"#,
    )
    .unwrap();
    assert_eq!(message.payload, serde_json::Value::Null);
    assert_eq!(message.delivery_count, 0);
  }

  #[test]
  fn test_for_step_gets_new_id() {
    let message = TriggerMessage::new("P1", "R1", "fetch", json!(null));
    let next = message.for_step("analyze", json!({"rows": 3}));

    assert_ne!(next.message_id, message.message_id);
    assert_eq!(next.run_id, "R1");
    assert_eq!(next.step_name, "analyze");
    assert_eq!(next.delivery_count, 0);
  }

  #[test]
  fn test_redelivered_keeps_id() {
    let message = TriggerMessage::new("P1", "R1", "fetch", json!(null));
    let again = message.redelivered().redelivered();

    assert_eq!(again.message_id, message.message_id);
    assert_eq!(again.delivery_count, 2);
  }
}
