//! Integration tests for the dispatcher and dispatch runner.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use solstice_blob::InMemoryBlobSink;
use solstice_config::{EnginePolicy, SolsticeConfig};
use solstice_deadletter::{ChannelNotifier, DeadLetterAbsorber, DeadLetterRouter, QueueRoutes};
use solstice_dispatcher::{
  ChannelTriggerSink, DispatchError, DispatchOutcome, DispatchRunner, Dispatcher, HandlerError,
  HandlerRegistry, NoopTriggerSink, StepContext, TriggerMessage,
};
use solstice_store::{InMemoryRunStore, RunStatus, StepStatus};
use solstice_transition::{StepTransitionEngine, TransitionError};
use solstice_workflow::PipelineSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn engine_with(store: Arc<InMemoryRunStore>, policy: &EnginePolicy) -> StepTransitionEngine {
  let pipelines = Arc::new(PipelineSet::from_config(&SolsticeConfig::default()).unwrap());
  StepTransitionEngine::new(store, pipelines, policy)
}

fn helioscope_handlers(calls: Arc<AtomicUsize>) -> HandlerRegistry {
  let mut handlers = HandlerRegistry::new();
  for step in ["fetch", "analyze", "generate"] {
    let calls = calls.clone();
    handlers.register_fn(step, move |ctx: StepContext| {
      let calls = calls.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, HandlerError>(json!({
          "step": ctx.step_name,
          "seen": ctx.results.len(),
        }))
      }
    });
  }
  handlers
}

#[tokio::test]
async fn test_dispatch_drives_pipeline_to_completion() {
  let store = Arc::new(InMemoryRunStore::new());
  let policy = EnginePolicy::default();
  let engine = engine_with(store, &policy);
  engine
    .create_workflow_run("P1", "R1", "helioscope_processing")
    .await
    .unwrap();

  let (tx, mut rx) = mpsc::channel(8);
  let calls = Arc::new(AtomicUsize::new(0));
  let dispatcher = Dispatcher::new(
    engine.clone(),
    Arc::new(helioscope_handlers(calls.clone())),
    Arc::new(ChannelTriggerSink::new(tx)),
    &policy,
  );

  let first = TriggerMessage::new("P1", "R1", "fetch", json!({"source": "s3://roof"}));
  assert_eq!(
    dispatcher.dispatch(&first).await.unwrap(),
    DispatchOutcome::Advanced {
      next_step: "analyze".to_string()
    }
  );

  let second = rx.recv().await.unwrap();
  assert_eq!(second.step_name, "analyze");
  assert_eq!(second.payload, json!({"step": "fetch", "seen": 0}));
  assert_eq!(
    dispatcher.dispatch(&second).await.unwrap(),
    DispatchOutcome::Advanced {
      next_step: "generate".to_string()
    }
  );

  let third = rx.recv().await.unwrap();
  assert_eq!(dispatcher.dispatch(&third).await.unwrap(), DispatchOutcome::Finished);
  assert!(rx.try_recv().is_err());

  let run = engine.get_workflow_state("P1", "R1").await.unwrap();
  assert_eq!(run.run_status, RunStatus::Completed);
  assert_eq!(run.results.len(), 3);
  assert_eq!(run.results["generate"], json!({"step": "generate", "seen": 2}));
  assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_redelivered_trigger_is_duplicate() {
  let policy = EnginePolicy::default();
  let engine = engine_with(Arc::new(InMemoryRunStore::new()), &policy);
  engine
    .create_workflow_run("P1", "R1", "helioscope_processing")
    .await
    .unwrap();

  let calls = Arc::new(AtomicUsize::new(0));
  let dispatcher = Dispatcher::new(
    engine.clone(),
    Arc::new(helioscope_handlers(calls.clone())),
    Arc::new(NoopTriggerSink),
    &policy,
  );

  let message = TriggerMessage::new("P1", "R1", "fetch", json!(null));
  dispatcher.dispatch(&message).await.unwrap();
  let before = engine.get_workflow_state("P1", "R1").await.unwrap();

  let again = dispatcher.dispatch(&message.redelivered()).await.unwrap();

  assert_eq!(again, DispatchOutcome::Duplicate);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  let after = engine.get_workflow_state("P1", "R1").await.unwrap();
  assert_eq!(after.version, before.version);
}

#[tokio::test]
async fn test_missing_handler_fails_step() {
  let policy = EnginePolicy::default();
  let engine = engine_with(Arc::new(InMemoryRunStore::new()), &policy);
  engine
    .create_workflow_run("P1", "R1", "solar_project")
    .await
    .unwrap();
  let dispatcher = Dispatcher::new(
    engine.clone(),
    Arc::new(HandlerRegistry::new()),
    Arc::new(NoopTriggerSink),
    &policy,
  );

  let outcome = dispatcher
    .dispatch(&TriggerMessage::new("P1", "R1", "research", json!(null)))
    .await
    .unwrap();

  let expected = "no handler registered for step 'research'".to_string();
  assert_eq!(
    outcome,
    DispatchOutcome::Failed {
      error: expected.clone()
    }
  );
  let run = engine.get_workflow_state("P1", "R1").await.unwrap();
  assert_eq!(run.run_status, RunStatus::Failed);
  assert_eq!(run.error_details, Some(expected));
}

#[tokio::test]
async fn test_handler_error_fails_step_without_advancing() {
  let policy = EnginePolicy::default();
  let engine = engine_with(Arc::new(InMemoryRunStore::new()), &policy);
  engine
    .create_workflow_run("P1", "R1", "solar_project")
    .await
    .unwrap();

  let mut handlers = HandlerRegistry::new();
  handlers.register_fn("research", |_ctx| async {
    Err::<serde_json::Value, _>(HandlerError::new("permit matrix unavailable"))
  });
  let (tx, mut rx) = mpsc::channel(1);
  let dispatcher = Dispatcher::new(
    engine.clone(),
    Arc::new(handlers),
    Arc::new(ChannelTriggerSink::new(tx)),
    &policy,
  );

  let outcome = dispatcher
    .dispatch(&TriggerMessage::new("P1", "R1", "research", json!(null)))
    .await
    .unwrap();

  assert_eq!(
    outcome,
    DispatchOutcome::Failed {
      error: "permit matrix unavailable".to_string()
    }
  );
  assert!(rx.try_recv().is_err());
  let run = engine.get_workflow_state("P1", "R1").await.unwrap();
  let step = run.step("research").unwrap();
  assert_eq!(step.status, StepStatus::Failed);
  assert_eq!(step.error.as_deref(), Some("permit matrix unavailable"));
  assert_eq!(run.step("design").unwrap().status, StepStatus::Pending);
}

#[tokio::test]
async fn test_handler_panic_fails_step() {
  let policy = EnginePolicy::default();
  let engine = engine_with(Arc::new(InMemoryRunStore::new()), &policy);
  engine
    .create_workflow_run("P1", "R1", "solar_project")
    .await
    .unwrap();

  let mut handlers = HandlerRegistry::new();
  handlers.register_fn("research", |_ctx| async {
    if true {
      panic!("lookup table corrupted");
    }
    Ok::<_, HandlerError>(json!(null))
  });
  let dispatcher = Dispatcher::new(
    engine.clone(),
    Arc::new(handlers),
    Arc::new(NoopTriggerSink),
    &policy,
  );

  let outcome = dispatcher
    .dispatch(&TriggerMessage::new("P1", "R1", "research", json!(null)))
    .await
    .unwrap();

  assert_eq!(
    outcome,
    DispatchOutcome::Failed {
      error: "handler for step 'research' panicked".to_string()
    }
  );
}

#[tokio::test]
async fn test_handler_timeout_fails_step() {
  let policy = EnginePolicy {
    handler_timeout_ms: Some(20),
    ..EnginePolicy::default()
  };
  let engine = engine_with(Arc::new(InMemoryRunStore::new()), &policy);
  engine
    .create_workflow_run("P1", "R1", "solar_project")
    .await
    .unwrap();

  let mut handlers = HandlerRegistry::new();
  handlers.register_fn("research", |_ctx| async {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Ok::<_, HandlerError>(json!(null))
  });
  let dispatcher = Dispatcher::new(
    engine.clone(),
    Arc::new(handlers),
    Arc::new(NoopTriggerSink),
    &policy,
  );

  let outcome = dispatcher
    .dispatch(&TriggerMessage::new("P1", "R1", "research", json!(null)))
    .await
    .unwrap();

  assert_eq!(
    outcome,
    DispatchOutcome::Failed {
      error: "handler for step 'research' timed out after 20ms".to_string()
    }
  );
}

#[tokio::test]
async fn test_dropped_dispatch_aborts_handler() {
  let policy = EnginePolicy::default();
  let engine = engine_with(Arc::new(InMemoryRunStore::new()), &policy);
  engine
    .create_workflow_run("P1", "R1", "solar_project")
    .await
    .unwrap();

  let finished = Arc::new(AtomicUsize::new(0));
  let mut handlers = HandlerRegistry::new();
  let flag = finished.clone();
  handlers.register_fn("research", move |_ctx| {
    let flag = flag.clone();
    async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      flag.fetch_add(1, Ordering::SeqCst);
      Ok::<_, HandlerError>(json!(null))
    }
  });
  let dispatcher = Dispatcher::new(
    engine.clone(),
    Arc::new(handlers),
    Arc::new(NoopTriggerSink),
    &policy,
  );

  let trigger = TriggerMessage::new("P1", "R1", "research", json!(null));
  let dropped =
    tokio::time::timeout(Duration::from_millis(20), dispatcher.dispatch(&trigger)).await;
  assert!(dropped.is_err());

  tokio::time::sleep(Duration::from_millis(250)).await;
  assert_eq!(finished.load(Ordering::SeqCst), 0);

  let run = engine.get_workflow_state("P1", "R1").await.unwrap();
  assert_eq!(run.step("research").unwrap().status, StepStatus::Processing);
}

#[tokio::test]
async fn test_engine_errors_propagate() {
  let policy = EnginePolicy::default();
  let store = Arc::new(InMemoryRunStore::new());
  let engine = engine_with(store.clone(), &policy);
  let dispatcher = Dispatcher::new(
    engine,
    Arc::new(HandlerRegistry::pass_through(["fetch"])),
    Arc::new(NoopTriggerSink),
    &policy,
  );
  let message = TriggerMessage::new("P1", "R1", "fetch", json!(null));

  let missing = dispatcher.dispatch(&message).await.unwrap_err();
  assert!(matches!(
    missing,
    DispatchError::Transition(TransitionError::RunNotFound { .. })
  ));

  store.set_unavailable(true);
  let unavailable = dispatcher.dispatch(&message).await.unwrap_err();
  assert!(matches!(
    unavailable,
    DispatchError::Transition(TransitionError::Store(_))
  ));
}

struct RunnerHarness {
  engine: StepTransitionEngine,
  store: Arc<InMemoryRunStore>,
  blob: Arc<InMemoryBlobSink>,
  runner: DispatchRunner,
  records: mpsc::UnboundedReceiver<solstice_deadletter::FailureRecord>,
}

fn runner_harness(policy: EnginePolicy) -> RunnerHarness {
  let config = SolsticeConfig {
    policy,
    ..SolsticeConfig::default()
  };
  let store = Arc::new(InMemoryRunStore::new());
  let engine = engine_with(store.clone(), &config.policy);
  let blob = Arc::new(InMemoryBlobSink::new());
  let (notify_tx, records) = mpsc::unbounded_channel();
  let absorber = DeadLetterAbsorber::new(
    blob.clone(),
    engine.clone(),
    QueueRoutes::from_config(&config),
    Arc::new(ChannelNotifier::new(notify_tx)),
  );

  let (tx, rx) = mpsc::channel(16);
  let dispatcher = Dispatcher::new(
    engine.clone(),
    Arc::new(HandlerRegistry::pass_through(["fetch", "analyze", "generate"])),
    Arc::new(ChannelTriggerSink::new(tx.clone())),
    &config.policy,
  );
  let runner = DispatchRunner::with_channel(
    (tx, rx),
    Arc::new(dispatcher),
    Arc::new(DeadLetterRouter::new(Arc::new(absorber))),
    &config.policy,
  )
  .with_redelivery_delay(Duration::from_millis(1));

  RunnerHarness {
    engine,
    store,
    blob,
    runner,
    records,
  }
}

#[tokio::test]
async fn test_runner_completes_pipeline() {
  let h = runner_harness(EnginePolicy::default());
  h.engine
    .create_workflow_run("P1", "R1", "helioscope_processing")
    .await
    .unwrap();
  h.runner
    .submit(TriggerMessage::new("P1", "R1", "fetch", json!({"file": "roof.csv"})))
    .await
    .unwrap();

  let cancel = CancellationToken::new();
  let handle = tokio::spawn(h.runner.start(cancel.clone()));

  let run = tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      let run = h.engine.get_workflow_state("P1", "R1").await.unwrap();
      if run.run_status.is_terminal() {
        return run;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .unwrap();

  cancel.cancel();
  handle.await.unwrap().unwrap();

  assert_eq!(run.run_status, RunStatus::Completed);
  assert_eq!(run.results["generate"], json!({"file": "roof.csv"}));
}

#[tokio::test]
async fn test_runner_dead_letters_poison_trigger() {
  let mut h = runner_harness(EnginePolicy {
    max_delivery_count: 3,
    ..EnginePolicy::default()
  });
  h.engine
    .create_workflow_run("P1", "R1", "helioscope_processing")
    .await
    .unwrap();
  h.store.set_unavailable(true);

  let message = TriggerMessage::new("P1", "R1", "fetch", json!(null));
  h.runner.submit(message.clone()).await.unwrap();

  let cancel = CancellationToken::new();
  let handle = tokio::spawn(h.runner.start(cancel.clone()));

  let record = tokio::time::timeout(Duration::from_secs(5), h.records.recv())
    .await
    .unwrap()
    .unwrap();

  cancel.cancel();
  handle.await.unwrap().unwrap();

  assert_eq!(record.message_id, message.message_id);
  assert_eq!(record.failure_type, "fetch");
  assert_eq!(record.source_queue, "fetch-queue");
  assert_eq!(record.run_id.as_deref(), Some("R1"));
  assert_eq!(record.step_name.as_deref(), Some("fetch"));
  assert_eq!(record.transition, None);
  assert_eq!(h.blob.keys().len(), 1);

  let (_, body) = h.blob.snapshot(&h.blob.keys()[0]).unwrap();
  let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
  let trigger: TriggerMessage =
    serde_json::from_str(envelope["rawPayload"].as_str().unwrap()).unwrap();
  assert_eq!(trigger.delivery_count, 3);
}
