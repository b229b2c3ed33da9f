use std::collections::HashMap;

use solstice_config::{QueueRouteDef, SolsticeConfig};

/// Lookup tables over the configured dead-letter routes.
#[derive(Debug, Clone, Default)]
pub struct QueueRoutes {
  by_failure_type: HashMap<String, QueueRouteDef>,
  by_queue: HashMap<String, QueueRouteDef>,
  by_step: HashMap<String, QueueRouteDef>,
}

impl QueueRoutes {
  /// Build from route definitions. Later definitions win on collisions.
  pub fn new(routes: impl IntoIterator<Item = QueueRouteDef>) -> Self {
    let mut table = Self::default();
    for route in routes {
      table.insert(route);
    }
    table
  }

  pub fn from_config(config: &SolsticeConfig) -> Self {
    Self::new(config.queue_routes())
  }

  pub fn insert(&mut self, route: QueueRouteDef) {
    self
      .by_failure_type
      .insert(route.failure_type.clone(), route.clone());
    self.by_queue.insert(route.queue_name.clone(), route.clone());
    self.by_step.insert(route.step_name.clone(), route);
  }

  /// The step a failure type marks failed.
  pub fn step_for_failure_type(&self, failure_type: &str) -> Option<&str> {
    self
      .by_failure_type
      .get(failure_type)
      .map(|r| r.step_name.as_str())
  }

  /// The failure type registered for a queue.
  pub fn failure_type_for_queue(&self, queue_name: &str) -> Option<&str> {
    self
      .by_queue
      .get(queue_name)
      .map(|r| r.failure_type.as_str())
  }

  /// The queue triggers for a step are delivered on.
  pub fn queue_for_step(&self, step_name: &str) -> Option<&str> {
    self.by_step.get(step_name).map(|r| r.queue_name.as_str())
  }

  /// `(queue_name, failure_type)` for every route.
  pub fn queues(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .by_queue
      .values()
      .map(|r| (r.queue_name.as_str(), r.failure_type.as_str()))
  }

  pub fn len(&self) -> usize {
    self.by_queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_queue.is_empty()
  }
}
