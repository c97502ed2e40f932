use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_config::WorkflowDef;
use stepflow_engine::{ExecutionContext, Runner, WorkflowGraph};

mod builtin;

/// Stepflow - run dependency-ordered workflows of steps
#[derive(Parser)]
#[command(name = "stepflow")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Log at debug level (overridden by RUST_LOG)
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a workflow and print its result as JSON
  Run {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,

    /// Override the maximum number of concurrently running steps
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Stop starting new steps after the first failure
    #[arg(long)]
    stop_on_error: bool,

    /// Override the default retry count
    #[arg(long)]
    retries: Option<u32>,

    /// Run metadata visible to every step, as KEY=VALUE
    #[arg(long = "meta", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,
  },

  /// Check a workflow file and print its steps in execution order
  Validate {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },

  /// Print the normalized workflow definition as JSON
  Show {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match cli.command {
    Some(Commands::Run {
      workflow_file,
      max_parallel,
      stop_on_error,
      retries,
      metadata,
    }) => {
      let mut def = load_workflow(&workflow_file)?;
      if let Some(max_parallel) = max_parallel {
        def.config.max_parallel_steps = max_parallel;
      }
      if stop_on_error {
        def.config.stop_on_error = true;
      }
      if let Some(retries) = retries {
        def.config.default_retry_count = retries;
      }
      let graph = resolve(def)?;

      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_workflow(graph, metadata))
    }
    Some(Commands::Validate { workflow_file }) => {
      let graph = resolve(load_workflow(&workflow_file)?)?;
      print_execution_order(&graph);
      Ok(ExitCode::SUCCESS)
    }
    Some(Commands::Show { workflow_file }) => {
      let graph = resolve(load_workflow(&workflow_file)?)?;
      println!("{}", serde_json::to_string_pretty(&graph.to_def())?);
      Ok(ExitCode::SUCCESS)
    }
    None => {
      println!("stepflow - use --help to see available commands");
      Ok(ExitCode::SUCCESS)
    }
  }
}

fn init_tracing(verbose: bool) {
  let default = if verbose { "stepflow=debug,warn" } else { "stepflow=info,warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
    .with_target(false)
    .with_writer(std::io::stderr)
    .init();
}

fn load_workflow(path: &Path) -> Result<WorkflowDef> {
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read workflow file: {}", path.display()))?;

  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse workflow file: {}", path.display()))
}

fn resolve(def: WorkflowDef) -> Result<WorkflowGraph> {
  builtin::registry()
    .context("failed to register built-in delegates")?
    .resolve(def)
    .context("invalid workflow")
}

async fn run_workflow(graph: WorkflowGraph, metadata: Vec<(String, String)>) -> Result<ExitCode> {
  let context = metadata
    .into_iter()
    .fold(ExecutionContext::new(), |ctx, (key, value)| ctx.with_metadata(key, value));

  // Ctrl-C cancels the run; steps that have not started are skipped.
  let cancel = CancellationToken::new();
  let on_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupt received, cancelling workflow");
      on_signal.cancel();
    }
  });

  let result = Runner::new()
    .run_with_cancel(&graph, context, cancel)
    .await
    .context("workflow execution failed")?;

  info!(
    run_id = %result.run_id,
    status = %result.status,
    failed = result.failed_steps().len(),
    skipped = result.skipped_steps().len(),
    "run finished"
  );
  println!("{}", serde_json::to_string_pretty(&result)?);

  Ok(if result.success {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

fn print_execution_order(graph: &WorkflowGraph) {
  let config = graph.config();
  println!("workflow '{}' is valid: {} steps", graph.name(), graph.len());
  if !graph.description().is_empty() {
    println!("  {}", graph.description());
  }
  println!(
    "  max_parallel_steps={} stop_on_error={} default_retry_count={} default_timeout_ms={}",
    config.max_parallel_steps,
    config.stop_on_error,
    config.default_retry_count,
    config.default_timeout_ms
  );

  for (position, step_id) in graph.execution_order().into_iter().enumerate() {
    let Some(step) = graph.step(step_id) else {
      continue;
    };
    let deps = step.dependencies();
    println!(
      "{:>3}. {} ({}) [{}]{}",
      position + 1,
      step.id(),
      step.name(),
      step.delegate_name().unwrap_or("-"),
      if deps.is_empty() {
        String::new()
      } else {
        format!(" after {}", deps.join(", "))
      }
    );
  }
}

fn parse_key_value(raw: &str) -> Result<(String, String)> {
  let Some((key, value)) = raw.split_once('=') else {
    bail!("expected KEY=VALUE, got '{raw}'");
  };
  if key.is_empty() {
    bail!("metadata key must not be empty");
  }
  Ok((key.to_string(), value.to_string()))
}
