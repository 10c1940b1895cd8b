//! extraction-run - run one similarity extraction pipeline
//!
//! Reads the execution input as JSON, drives the pipeline with external
//! worker commands and prints the outcome as JSON on stdout.

use anyhow::{Context as _, Result};
use clap::Parser;
use extraction_core::CancellationHandle;
use extraction_orchestrator::command_invoker::CommandInvoker;
use extraction_orchestrator::config::{load_config, Config, StorageBackend};
use extraction_orchestrator::Coordinator;
use extraction_storage::{LocalStagingStore, MemoryStagingStore, S3StagingStore, StagingStore};
use serde_json::{json, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "extraction-run",
    version,
    about = "Run the similarity extraction pipeline on one request",
    after_help = "EXAMPLES:\n  \
                  # Input from a file, workers from a config file\n  \
                  extraction-run --config extraction.toml --input request.json\n\n  \
                  # Input on stdin, staging under ./runs\n  \
                  cat request.json | extraction-run --config extraction.toml --store-root ./runs"
)]
struct Cli {
    /// Execution input JSON file (reads stdin when omitted or "-")
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Execution id (a fresh UUID when omitted)
    #[arg(long)]
    execution_id: Option<String>,

    /// Stage under this directory, overriding the configured backend
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Abort in-flight items as soon as a stage exceeds its failure tolerance
    #[arg(long)]
    fail_fast: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr, stdout carries the JSON outcome
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let input = read_input(cli.input.as_deref())?;

    let store = open_store(&config, cli.store_root.clone()).await?;
    let invoker = CommandInvoker::from_config(&config.invoker(), store.location())
        .context("Invalid invoker configuration")?;

    let mut options = config.coordinator_options();
    options.fail_fast |= cli.fail_fast;
    let coordinator = Coordinator::with_options(store, Arc::new(invoker), options);

    let cancel = CancellationHandle::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let execution_id = cli
        .execution_id
        .unwrap_or_else(extraction_core::new_execution_id);
    info!(execution_id = %execution_id, "Submitting run");

    match coordinator.execute_with(execution_id, input, &cancel).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            let report = json!({
                "execution_id": failure.execution_id,
                "state": failure.state,
                "kind": failure.error.kind(),
                "error": failure.error.to_string(),
                "succeeded": failure.succeeded,
                "failed": failure.failed,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_input(path: Option<&Path>) -> Result<Value> {
    let raw = match path {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?,
        _ => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("Failed to read input from stdin")?;
            raw
        }
    };
    serde_json::from_str(&raw).context("Execution input is not valid JSON")
}

async fn open_store(config: &Config, store_root: Option<PathBuf>) -> Result<Arc<dyn StagingStore>> {
    if let Some(root) = store_root {
        return Ok(Arc::new(LocalStagingStore::new(root).await?));
    }

    let store: Arc<dyn StagingStore> = match config.storage_backend() {
        StorageBackend::Memory => {
            warn!("Memory staging store is not visible to external workers");
            Arc::new(MemoryStagingStore::new())
        }
        StorageBackend::Local => {
            let root = config.storage_root();
            Arc::new(
                LocalStagingStore::new(&root)
                    .await
                    .with_context(|| format!("Failed to open staging root {}", root.display()))?,
            )
        }
        StorageBackend::S3 => Arc::new(
            S3StagingStore::new(config.s3_config())
                .await
                .context("Failed to create S3 staging store")?,
        ),
    };
    Ok(store)
}
