use serde::{Deserialize, Serialize};

/// Routing for one dead-letter queue category.
///
/// `queue_name` is the broker queue the poison message came from,
/// `failure_type` the category recorded with the absorbed payload, and
/// `step_name` the pipeline step marked failed when the run is identified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRouteDef {
  pub queue_name: String,
  pub failure_type: String,
  pub step_name: String,
}

impl QueueRouteDef {
  /// The conventional route for a step: `{step}-queue`, failure type `{step}`.
  pub fn for_step(step: &str) -> Self {
    Self {
      queue_name: format!("{}-queue", step),
      failure_type: step.to_string(),
      step_name: step.to_string(),
    }
  }
}
