use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::absorber::{AbsorptionReport, DeadLetterAbsorber};

/// Failure type recorded for queues nobody registered.
pub const UNRECOGNIZED_FAILURE_TYPE: &str = "unrecognized";

/// Entry point for the broker's poison path.
///
/// Holds one registration per known queue and falls back to a catch-all for
/// anything else, so every dead-lettered message reaches the absorber.
pub struct DeadLetterRouter {
  absorber: Arc<DeadLetterAbsorber>,
  registrations: HashMap<String, String>,
}

impl DeadLetterRouter {
  /// A router with one registration per configured queue route.
  pub fn new(absorber: Arc<DeadLetterAbsorber>) -> Self {
    let mut router = Self::empty(absorber.clone());
    for (queue_name, failure_type) in absorber.routes().queues() {
      router.register(queue_name, failure_type);
    }
    router
  }

  /// A router with no registrations; everything goes to the catch-all.
  pub fn empty(absorber: Arc<DeadLetterAbsorber>) -> Self {
    Self {
      absorber,
      registrations: HashMap::new(),
    }
  }

  pub fn register(&mut self, queue_name: impl Into<String>, failure_type: impl Into<String>) {
    self
      .registrations
      .insert(queue_name.into(), failure_type.into());
  }

  /// The failure type a queue's messages are absorbed under.
  pub fn failure_type_for(&self, queue_name: &str) -> &str {
    self
      .registrations
      .get(queue_name)
      .map(String::as_str)
      .unwrap_or(UNRECOGNIZED_FAILURE_TYPE)
  }

  /// The queue a step's triggers are delivered on, if one is configured.
  pub fn queue_for_step(&self, step_name: &str) -> Option<&str> {
    self.absorber.routes().queue_for_step(step_name)
  }

  /// Absorb a message that arrived on `queue_name`'s poison path.
  pub async fn route(
    &self,
    queue_name: &str,
    raw_payload: &[u8],
    message_id: &str,
  ) -> AbsorptionReport {
    let failure_type = self.failure_type_for(queue_name);
    if failure_type == UNRECOGNIZED_FAILURE_TYPE {
      warn!(queue_name, message_id, "dead letter from unregistered queue");
    }
    self
      .absorber
      .absorb(failure_type, raw_payload, message_id, queue_name)
      .await
  }
}
