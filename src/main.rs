mod logging;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use solstice_blob::FsBlobSink;
use solstice_config::SolsticeConfig;
use solstice_deadletter::{DeadLetterAbsorber, DeadLetterRouter, LogNotifier, QueueRoutes};
use solstice_dispatcher::{
  ChannelTriggerSink, DispatchRunner, Dispatcher, HandlerRegistry, TriggerMessage,
};
use solstice_store::{SqliteRunStore, StepStatus, WorkflowRun};
use solstice_transition::StepTransitionEngine;
use solstice_workflow::PipelineSet;

/// Solstice - workflow orchestration for solar project pipelines
#[derive(Parser)]
#[command(name = "solstice")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.solstice)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to a JSON config file (default: built-in pipelines)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Log level used when RUST_LOG is not set
  #[arg(long, global = true, default_value = "info")]
  log_level: String,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Create a workflow run with every step pending
  Create {
    project_id: String,
    run_id: String,
    /// Pipeline to follow, e.g. solar_project
    #[arg(long)]
    workflow_type: String,
  },

  /// Print the state of a run
  Status { project_id: String, run_id: String },

  /// List the runs of a project, most recently updated first
  List { project_id: String },

  /// Claim a step for processing
  Claim {
    project_id: String,
    run_id: String,
    step: String,
  },

  /// Set the status of a step
  Update {
    project_id: String,
    run_id: String,
    step: String,
    #[arg(long, value_enum)]
    status: StatusArg,
    /// Step output as JSON, kept when the step completes
    #[arg(long)]
    output: Option<String>,
    /// Error details, kept when the step fails
    #[arg(long)]
    error: Option<String>,
  },

  /// Absorb a dead-lettered message read from stdin
  Absorb {
    /// Queue the message was dead-lettered from
    #[arg(long)]
    queue: String,
    /// Failure type to record; derived from the queue when omitted
    #[arg(long)]
    failure_type: Option<String>,
    /// Broker message id (default: random)
    #[arg(long)]
    message_id: Option<String>,
  },

  /// Create a run and drive it to the end with pass-through handlers
  Run {
    project_id: String,
    run_id: String,
    #[arg(long)]
    workflow_type: String,
    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
  },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl From<StatusArg> for StepStatus {
  fn from(status: StatusArg) -> Self {
    match status {
      StatusArg::Pending => StepStatus::Pending,
      StatusArg::Processing => StepStatus::Processing,
      StatusArg::Completed => StepStatus::Completed,
      StatusArg::Failed => StepStatus::Failed,
    }
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  logging::init(&cli.log_level);

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".solstice"),
  };

  let Some(command) = cli.command else {
    println!("solstice - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let app = App::open(&data_dir, cli.config.as_deref()).await?;
    app.execute(command).await
  })
}

/// Everything a command needs, wired once from the data directory.
struct App {
  config: SolsticeConfig,
  engine: StepTransitionEngine,
  absorber: Arc<DeadLetterAbsorber>,
}

impl App {
  async fn open(data_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
    let config = match config_path {
      Some(path) => SolsticeConfig::load(path)
        .with_context(|| format!("failed to load config: {}", path.display()))?,
      None => SolsticeConfig::default(),
    };

    tokio::fs::create_dir_all(data_dir)
      .await
      .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let db_url = format!("sqlite://{}", data_dir.join("runs.db").display());
    let store = SqliteRunStore::connect(&db_url)
      .await
      .context("failed to open run store")?;

    let pipelines = PipelineSet::from_config(&config).context("invalid pipeline configuration")?;
    let engine =
      StepTransitionEngine::new(Arc::new(store), Arc::new(pipelines), &config.policy);

    let absorber = Arc::new(DeadLetterAbsorber::new(
      Arc::new(FsBlobSink::new(data_dir.join("blobs"))),
      engine.clone(),
      QueueRoutes::from_config(&config),
      Arc::new(LogNotifier),
    ));

    Ok(Self {
      config,
      engine,
      absorber,
    })
  }

  async fn execute(self, command: Commands) -> Result<()> {
    match command {
      Commands::Create {
        project_id,
        run_id,
        workflow_type,
      } => {
        let run = self
          .engine
          .create_workflow_run(&project_id, &run_id, &workflow_type)
          .await
          .context("failed to create workflow run")?;
        print_json(&run)
      }

      Commands::Status { project_id, run_id } => {
        let run = self
          .engine
          .get_workflow_state(&project_id, &run_id)
          .await
          .context("failed to read workflow run")?;
        print_json(&run)
      }

      Commands::List { project_id } => {
        let runs = self
          .engine
          .list_runs(&project_id)
          .await
          .context("failed to list workflow runs")?;
        print_json(&runs)
      }

      Commands::Claim {
        project_id,
        run_id,
        step,
      } => {
        let claimed = self
          .engine
          .mark_step_processing_with_idempotency(&project_id, &run_id, &step)
          .await
          .context("failed to claim step")?;
        print_json(&serde_json::json!({ "claimed": claimed }))
      }

      Commands::Update {
        project_id,
        run_id,
        step,
        status,
        output,
        error,
      } => {
        let output: Option<serde_json::Value> = output
          .map(|raw| serde_json::from_str(&raw))
          .transpose()
          .context("failed to parse --output as JSON")?;
        let outcome = self
          .engine
          .update_step_status(&project_id, &run_id, &step, status.into(), output, error)
          .await
          .context("failed to update step")?;
        print_json(&serde_json::json!({ "outcome": outcome }))
      }

      Commands::Absorb {
        queue,
        failure_type,
        message_id,
      } => {
        let payload = read_bytes_from_stdin()?;
        let message_id = message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let report = match failure_type {
          Some(failure_type) => {
            self
              .absorber
              .absorb(&failure_type, &payload, &message_id, &queue)
              .await
          }
          None => {
            DeadLetterRouter::new(self.absorber.clone())
              .route(&queue, &payload, &message_id)
              .await
          }
        };
        match report.record() {
          Some(record) => print_json(record),
          None => bail!("absorbing message {} panicked, message discarded", message_id),
        }
      }

      Commands::Run {
        project_id,
        run_id,
        workflow_type,
        timeout_secs,
      } => {
        let payload = read_payload_from_stdin()?;
        let run = self
          .run_pipeline(&project_id, &run_id, &workflow_type, payload, timeout_secs)
          .await?;
        print_json(&run)
      }
    }
  }

  async fn run_pipeline(
    &self,
    project_id: &str,
    run_id: &str,
    workflow_type: &str,
    payload: serde_json::Value,
    timeout_secs: u64,
  ) -> Result<WorkflowRun> {
    let run = self
      .engine
      .create_workflow_run(project_id, run_id, workflow_type)
      .await
      .context("failed to create workflow run")?;
    let pipeline = self.engine.pipeline_for(&run)?;
    let first_step = pipeline.first_step();

    let (sender, receiver) = mpsc::channel(100);
    let dispatcher = Dispatcher::new(
      self.engine.clone(),
      Arc::new(HandlerRegistry::pass_through(
        pipeline.steps().iter().map(String::as_str),
      )),
      Arc::new(ChannelTriggerSink::new(sender.clone())),
      &self.config.policy,
    );
    let runner = DispatchRunner::with_channel(
      (sender, receiver),
      Arc::new(dispatcher),
      Arc::new(DeadLetterRouter::new(self.absorber.clone())),
      &self.config.policy,
    );
    runner
      .submit(TriggerMessage::new(project_id, run_id, first_step, payload))
      .await?;

    info!(project_id, run_id, workflow_type, "driving run with pass-through handlers");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runner.start(cancel.clone()));

    let finished = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
      loop {
        let run = self.engine.get_workflow_state(project_id, run_id).await?;
        if run.run_status.is_terminal() {
          return Ok::<_, anyhow::Error>(run);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
      }
    })
    .await;

    cancel.cancel();
    handle.await.context("dispatch runner task failed")??;

    match finished {
      Ok(run) => run,
      Err(_) => bail!(
        "run '{}/{}' did not finish within {}s",
        project_id,
        run_id,
        timeout_secs
      ),
    }
  }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn read_bytes_from_stdin() -> Result<Vec<u8>> {
  let mut input = Vec::new();
  io::stdin()
    .read_to_end(&mut input)
    .context("failed to read message from stdin")?;
  Ok(input)
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(serde_json::json!({}));
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read payload from stdin")?;

  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
  }
}
