//! Step handlers and the registry that maps step names to them.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Opaque failure reported by a step handler.
///
/// The message is recorded verbatim as the step's error details.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
  message: String,
}

impl HandlerError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

impl From<String> for HandlerError {
  fn from(message: String) -> Self {
    Self::new(message)
  }
}

impl From<&str> for HandlerError {
  fn from(message: &str) -> Self {
    Self::new(message)
  }
}

/// Everything a handler gets to see about the step it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub message_id: String,
  pub project_id: String,
  pub run_id: String,
  pub step_name: String,
  pub payload: serde_json::Value,
  /// Outputs of the steps completed so far, as of the claim.
  pub results: BTreeMap<String, serde_json::Value>,
}

/// Business logic for one pipeline step.
#[async_trait]
pub trait StepHandler: Send + Sync {
  async fn handle(&self, ctx: &StepContext) -> Result<serde_json::Value, HandlerError>;
}

type HandlerFn =
  Box<dyn Fn(StepContext) -> BoxFuture<'static, Result<serde_json::Value, HandlerError>> + Send + Sync>;

/// Adapts an async closure into a [`StepHandler`].
pub struct FnHandler {
  f: HandlerFn,
}

impl FnHandler {
  pub fn new<F, Fut>(f: F) -> Self
  where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
  {
    Self {
      f: Box::new(move |ctx| Box::pin(f(ctx))),
    }
  }
}

#[async_trait]
impl StepHandler for FnHandler {
  async fn handle(&self, ctx: &StepContext) -> Result<serde_json::Value, HandlerError> {
    (self.f)(ctx.clone()).await
  }
}

/// Returns the trigger payload unchanged.
#[derive(Debug, Clone, Default)]
pub struct PassThroughHandler;

#[async_trait]
impl StepHandler for PassThroughHandler {
  async fn handle(&self, ctx: &StepContext) -> Result<serde_json::Value, HandlerError> {
    Ok(ctx.payload.clone())
  }
}

/// Explicit `step name -> handler` table, built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry with a [`PassThroughHandler`] for every given step.
  pub fn pass_through<'a>(steps: impl IntoIterator<Item = &'a str>) -> Self {
    let mut registry = Self::new();
    for step in steps {
      registry.register(step, Arc::new(PassThroughHandler));
    }
    registry
  }

  /// Register a handler, replacing any previous one for the step.
  pub fn register(&mut self, step_name: impl Into<String>, handler: Arc<dyn StepHandler>) {
    self.handlers.insert(step_name.into(), handler);
  }

  pub fn register_fn<F, Fut>(&mut self, step_name: impl Into<String>, f: F)
  where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
  {
    self.register(step_name, Arc::new(FnHandler::new(f)));
  }

  pub fn get(&self, step_name: &str) -> Option<Arc<dyn StepHandler>> {
    self.handlers.get(step_name).cloned()
  }

  /// Registered step names, sorted.
  pub fn steps(&self) -> Vec<&str> {
    let mut steps: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
    steps.sort_unstable();
    steps
  }

  pub fn len(&self) -> usize {
    self.handlers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }
}
