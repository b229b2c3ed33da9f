use serde::{Deserialize, Serialize};

/// Retry and delivery policy for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginePolicy {
  /// Attempts allowed to resolve version conflicts on a single state write.
  pub max_conflict_retries: u32,
  /// Deliveries after which a trigger message is considered poison and is
  /// dead-lettered.
  pub max_delivery_count: u32,
  /// Optional per-handler timeout. A timed out handler fails its step.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub handler_timeout_ms: Option<u64>,
}

impl Default for EnginePolicy {
  fn default() -> Self {
    Self {
      max_conflict_retries: 3,
      max_delivery_count: 5,
      handler_timeout_ms: None,
    }
  }
}
