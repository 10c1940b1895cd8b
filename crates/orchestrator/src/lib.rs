//! Pipeline coordinator for similarity-driven extraction
//!
//! A run moves through a fixed, strictly linear sequence of states:
//!
//! ```text
//! Defaulting -> Split -> EmbeddingFanOut -> SimilaritySearch -> ExtractionFanOut -> Done
//! ```
//!
//! Any failure moves the run to `Failed`; nothing is retried. Stages hand
//! data to each other only through the staging store, under the run's
//! execution-scoped prefix. A run is refused when that prefix already holds
//! objects, so one id can never see another run's staging data.

pub mod command_invoker;
pub mod config;

use extraction_core::{
    config_from_input, new_execution_id, validate_execution_id, CancellationHandle,
    EmbedRequest, ExecutionContext, ExtractRequest, FanOutExecutor, FanOutSettings,
    InvocationFailure, InvocationKind, Invoker, JsonArrayItemSource, PipelineError,
    PipelineResult, PrefixItemSource, SearchRequest, SplitRequest, StageReport,
};
use extraction_storage::{StagingLayout, StagingStore, DEFAULT_LIST_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

pub use command_invoker::{CommandInvoker, CommandSpec};
pub use config::{load_config, Config, StorageBackend};

/// Stage name used for the embedding fan-out output prefix
pub const EMBEDDING_STAGE: &str = "embedding";

/// Stage name used for the extraction fan-out output prefix
pub const EXTRACTION_STAGE: &str = "extraction";

/// Finished runs kept in the registry before the oldest are dropped
pub const DEFAULT_RETAINED_RUNS: usize = 1024;

/// Position of a run in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Defaulting,
    Split,
    EmbeddingFanOut,
    SimilaritySearch,
    ExtractionFanOut,
    Done,
    Failed,
}

impl PipelineState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Defaulting => "defaulting",
            Self::Split => "split",
            Self::EmbeddingFanOut => "embedding_fan_out",
            Self::SimilaritySearch => "similarity_search",
            Self::ExtractionFanOut => "extraction_fan_out",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// State reached when the current one succeeds
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Defaulting => Some(Self::Split),
            Self::Split => Some(Self::EmbeddingFanOut),
            Self::EmbeddingFanOut => Some(Self::SimilaritySearch),
            Self::SimilaritySearch => Some(Self::ExtractionFanOut),
            Self::ExtractionFanOut => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Item counts of one fan-out stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

impl From<&StageReport> for StageCounts {
    fn from(report: &StageReport) -> Self {
        Self {
            succeeded: report.manifest.succeeded,
            failed: report.manifest.failed,
            total: report.manifest.total,
        }
    }
}

/// Result of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub execution_id: String,
    pub staging_prefix: String,
    pub store_location: String,
    pub split_prefix: String,
    pub embedding_manifest: String,
    pub embedding: StageCounts,
    pub search_results: String,
    pub extraction_manifest: String,
    pub extraction: StageCounts,

    /// Store keys of the per-item extraction results
    pub extraction_results: Vec<String>,

    pub history: Vec<PipelineState>,
}

/// A run that ended in `Failed`
#[derive(Debug, Error)]
#[error("run {execution_id} failed during {state}: {error}")]
pub struct PipelineFailure {
    pub execution_id: String,

    /// State the run was in when it failed
    pub state: PipelineState,

    #[source]
    pub error: PipelineError,

    pub succeeded: usize,
    pub failed: usize,
}

/// Snapshot of a tracked run
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub execution_id: String,
    pub state: PipelineState,
    pub failed_in: Option<PipelineState>,
    pub history: Vec<PipelineState>,
    pub embedding: Option<StageCounts>,
    pub extraction: Option<StageCounts>,
    pub error: Option<String>,

    #[serde(skip)]
    finished_at: Option<Instant>,
}

impl RunStatus {
    fn new(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            state: PipelineState::Defaulting,
            failed_in: None,
            history: vec![PipelineState::Defaulting],
            embedding: None,
            extraction: None,
            error: None,
            finished_at: None,
        }
    }

    fn fail(&mut self, reason: String) {
        self.failed_in = Some(self.state);
        self.state = PipelineState::Failed;
        self.history.push(PipelineState::Failed);
        self.error = Some(reason);
        self.finished_at = Some(Instant::now());
    }
}

/// Run-level knobs that are not part of the execution input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Abort in-flight fan-out items once a stage's tolerance is exceeded
    pub fail_fast: bool,

    /// Deadline for a whole run
    pub run_timeout: Option<Duration>,

    /// Keys requested per listing page when discovering chunks
    pub list_page_size: usize,

    /// Finished runs kept for [`Coordinator::run_status`]; the oldest are
    /// dropped when a new run registers past this limit
    pub retained_runs: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            fail_fast: false,
            run_timeout: None,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            retained_runs: DEFAULT_RETAINED_RUNS,
        }
    }
}

type RunHandle = Arc<Mutex<RunStatus>>;

/// Marks a run `Failed` when its `execute_with` future is dropped before
/// the run reached a terminal state
struct AbandonGuard(RunHandle);

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if let Ok(mut status) = self.0.try_lock() {
            abandon(&mut status);
            return;
        }
        // A status reader holds the lock for a moment
        let run = Arc::clone(&self.0);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                abandon(&mut *run.lock().await);
            });
        }
    }
}

fn abandon(status: &mut RunStatus) {
    if status.state.is_terminal() {
        return;
    }
    warn!(
        execution_id = %status.execution_id,
        state = %status.state,
        "Run abandoned before completion"
    );
    status.fail("run abandoned before completion".to_string());
}

/// Coordinator sequencing pipeline runs
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn StagingStore>,
    invoker: Arc<dyn Invoker>,
    options: CoordinatorOptions,

    /// Tracked runs by execution id
    runs: Arc<RwLock<HashMap<String, RunHandle>>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn StagingStore>, invoker: Arc<dyn Invoker>) -> Self {
        Self::with_options(store, invoker, CoordinatorOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn StagingStore>,
        invoker: Arc<dyn Invoker>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            invoker,
            options,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Run the pipeline under a fresh execution id
    pub async fn execute(&self, input: Value) -> Result<PipelineOutcome, PipelineFailure> {
        let cancel = CancellationHandle::new();
        self.execute_with(new_execution_id(), input, &cancel).await
    }

    /// Run the pipeline under `execution_id`, stopping early if `cancel`
    /// fires.
    ///
    /// An id is refused while a run with that id is still active, and also
    /// once its staging prefix holds objects from an earlier run. Dropping
    /// the returned future marks the run `Failed`.
    pub async fn execute_with(
        &self,
        execution_id: impl Into<String>,
        input: Value,
        cancel: &CancellationHandle,
    ) -> Result<PipelineOutcome, PipelineFailure> {
        let execution_id = execution_id.into();
        let (run, layout) = self.register(&execution_id).await.map_err(|error| {
            warn!(execution_id = %execution_id, error = %error, "Run rejected");
            PipelineFailure {
                execution_id: execution_id.clone(),
                state: PipelineState::Defaulting,
                error,
                succeeded: 0,
                failed: 0,
            }
        })?;
        let _abandon = AbandonGuard(Arc::clone(&run));

        info!(execution_id = %execution_id, "Starting pipeline run");

        let result = match self.options.run_timeout {
            Some(limit) => {
                let run_future = self.drive(&execution_id, input, layout, &run, cancel);
                match tokio::time::timeout(limit, run_future).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::cancelled(format!(
                        "run exceeded its {}s deadline",
                        limit.as_secs_f64()
                    ))),
                }
            }
            None => self.drive(&execution_id, input, layout, &run, cancel).await,
        };

        let mut status = run.lock().await;
        match result {
            Ok(outcome) => {
                info!(execution_id = %execution_id, "Pipeline run complete");
                Ok(outcome)
            }
            Err(error) => {
                let state = status.state;
                let (succeeded, failed) = error.item_counts();
                error!(
                    execution_id = %execution_id,
                    state = %state,
                    kind = error.kind(),
                    succeeded,
                    failed,
                    error = %error,
                    "Pipeline run failed"
                );
                status.fail(error.to_string());
                Err(PipelineFailure {
                    execution_id,
                    state,
                    error,
                    succeeded,
                    failed,
                })
            }
        }
    }

    /// Status of a tracked run
    pub async fn run_status(&self, execution_id: &str) -> Option<RunStatus> {
        let runs = self.runs.read().await;
        let run = runs.get(execution_id)?;
        let status = run.lock().await.clone();
        Some(status)
    }

    /// Ids of runs that have not reached a terminal state
    pub async fn active_runs(&self) -> Vec<String> {
        let runs = self.runs.read().await;
        let mut active = Vec::new();
        for (id, run) in runs.iter() {
            if !run.lock().await.state.is_terminal() {
                active.push(id.clone());
            }
        }
        active.sort();
        active
    }

    /// Remove a finished run from the registry.
    ///
    /// Returns `false` when the id is unknown or the run is still active.
    pub async fn forget(&self, execution_id: &str) -> bool {
        let mut runs = self.runs.write().await;
        let finished = match runs.get(execution_id) {
            Some(run) => run.lock().await.state.is_terminal(),
            None => return false,
        };
        if finished {
            runs.remove(execution_id);
        }
        finished
    }

    /// Track a new run and reserve its staging prefix.
    ///
    /// Holding the registry lock across the prefix check keeps two
    /// submissions of one id from both passing it.
    async fn register(&self, execution_id: &str) -> PipelineResult<(RunHandle, StagingLayout)> {
        validate_execution_id(execution_id)?;
        let layout = StagingLayout::today(execution_id);

        let mut runs = self.runs.write().await;
        if let Some(existing) = runs.get(execution_id) {
            if !existing.lock().await.state.is_terminal() {
                return Err(PipelineError::Configuration(format!(
                    "execution id '{execution_id}' is already running"
                )));
            }
        }

        let leftover = self.store.list_page(layout.prefix(), None, 1).await?;
        if !leftover.keys.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "execution id '{execution_id}' was already used: staging prefix '{}' is not empty",
                layout.prefix()
            )));
        }

        Self::prune_finished(&mut runs, self.options.retained_runs).await;
        let run = Arc::new(Mutex::new(RunStatus::new(execution_id)));
        runs.insert(execution_id.to_string(), Arc::clone(&run));
        Ok((run, layout))
    }

    /// Drop the oldest finished runs until at most `keep` remain
    async fn prune_finished(runs: &mut HashMap<String, RunHandle>, keep: usize) {
        let mut finished = Vec::new();
        for (id, run) in runs.iter() {
            if let Some(at) = run.lock().await.finished_at {
                finished.push((at, id.clone()));
            }
        }
        if finished.len() <= keep {
            return;
        }

        finished.sort();
        let excess = finished.len() - keep;
        for (_, id) in finished.into_iter().take(excess) {
            runs.remove(&id);
        }
    }

    /// Move the run into `state`, unless it has been cancelled
    async fn advance(
        &self,
        run: &RunHandle,
        state: PipelineState,
        cancel: &CancellationHandle,
    ) -> PipelineResult<()> {
        let mut status = run.lock().await;
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled(format!(
                "run cancelled before {state}"
            )));
        }
        debug_assert_eq!(status.state.next(), Some(state));
        info!(
            execution_id = %status.execution_id,
            from = %status.state,
            to = %state,
            "Pipeline state transition"
        );
        status.state = state;
        status.history.push(state);
        if state.is_terminal() {
            status.finished_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Require a stage output to live inside the run's namespace
    fn inside_run(ctx: &ExecutionContext, stage: &str, key: &str) -> PipelineResult<()> {
        if ctx.layout().contains(key) {
            Ok(())
        } else {
            Err(PipelineError::single_stage(
                stage,
                format!(
                    "output '{key}' is outside the staging prefix '{}'",
                    ctx.staging_prefix()
                ),
            ))
        }
    }

    async fn drive(
        &self,
        execution_id: &str,
        input: Value,
        layout: StagingLayout,
        run: &RunHandle,
        cancel: &CancellationHandle,
    ) -> PipelineResult<PipelineOutcome> {
        // Defaulting
        let mut ctx = ExecutionContext::with_layout(execution_id, config_from_input(input)?, layout)?;
        let settings = ctx.settings().clone();
        let fan_out = FanOutSettings::from_pipeline(&settings).with_fail_fast(self.options.fail_fast);
        let executor = FanOutExecutor::new(Arc::clone(&self.store), fan_out);
        info!(
            execution_id,
            staging_prefix = ctx.staging_prefix(),
            max_concurrency = settings.max_concurrency,
            tolerated_failure_percentage = settings.tolerated_failure_percentage,
            max_results = settings.similarity_search_max_results,
            "Configuration merged"
        );

        // Split
        self.advance(run, PipelineState::Split, cancel).await?;
        let split = self
            .invoker
            .split(SplitRequest {
                execution_id: execution_id.to_string(),
                staging_prefix: ctx.staging_prefix().to_string(),
            })
            .await
            .map_err(|f| PipelineError::single_stage(PipelineState::Split.name(), f.reason))?;
        let mut split_prefix = split.key_prefix;
        if !split_prefix.ends_with('/') {
            split_prefix.push('/');
        }
        Self::inside_run(&ctx, PipelineState::Split.name(), &split_prefix)?;
        ctx.split_prefix = Some(split_prefix.clone());

        // EmbeddingFanOut
        self.advance(run, PipelineState::EmbeddingFanOut, cancel).await?;
        let chunks = PrefixItemSource::new(Arc::clone(&self.store), split_prefix.clone())
            .with_page_size(self.options.list_page_size);
        let invoker = Arc::clone(&self.invoker);
        let id = execution_id.to_string();
        let embedding = executor
            .run(
                EMBEDDING_STAGE,
                execution_id,
                &ctx.layout().stage_output_prefix(EMBEDDING_STAGE),
                chunks,
                move |chunk| {
                    let invoker = Arc::clone(&invoker);
                    let request = EmbedRequest {
                        execution_id: id.clone(),
                        chunk,
                    };
                    async move {
                        let output = invoker.embed(request).await?;
                        to_payload(InvocationKind::Embed, &output)
                    }
                },
                cancel,
            )
            .await?;
        run.lock().await.embedding = Some(StageCounts::from(&embedding));
        if embedding.manifest.total == 0 {
            warn!(execution_id, "No chunks found under split prefix, searching an empty manifest");
        }
        ctx.embedding_manifest = Some(embedding.manifest_key.clone());

        // SimilaritySearch
        self.advance(run, PipelineState::SimilaritySearch, cancel).await?;
        let search_stage = PipelineState::SimilaritySearch.name();
        let search = self
            .invoker
            .search(SearchRequest {
                bucket: self.store.location().to_string(),
                manifest_key: embedding.manifest_key.clone(),
                execution_id: execution_id.to_string(),
                query: settings.query.clone(),
                max_results: settings.similarity_search_max_results,
            })
            .await
            .map_err(|f| PipelineError::single_stage(search_stage, f.reason))?;
        if search.bucket != self.store.location() {
            return Err(PipelineError::single_stage(
                search_stage,
                format!(
                    "results written to '{}', expected '{}'",
                    search.bucket,
                    self.store.location()
                ),
            ));
        }
        Self::inside_run(&ctx, search_stage, &search.object_key)?;
        ctx.search_results = Some(search.object_key.clone());

        // ExtractionFanOut
        self.advance(run, PipelineState::ExtractionFanOut, cancel).await?;
        let candidates = JsonArrayItemSource::load(self.store.as_ref(), &search.object_key).await?;
        let invoker = Arc::clone(&self.invoker);
        let id = execution_id.to_string();
        let extraction = executor
            .run(
                EXTRACTION_STAGE,
                execution_id,
                &ctx.layout().stage_output_prefix(EXTRACTION_STAGE),
                candidates,
                move |candidate| {
                    let invoker = Arc::clone(&invoker);
                    let request = ExtractRequest {
                        item: candidate.payload.unwrap_or(Value::Null),
                        execution_id: id.clone(),
                        model: settings.model.clone(),
                        schema: settings.schema.clone(),
                        instructions: settings.instructions.clone(),
                    };
                    async move { invoker.extract(request).await }
                },
                cancel,
            )
            .await?;
        run.lock().await.extraction = Some(StageCounts::from(&extraction));
        ctx.extraction_manifest = Some(extraction.manifest_key.clone());

        self.advance(run, PipelineState::Done, cancel).await?;
        let history = run.lock().await.history.clone();

        Ok(PipelineOutcome {
            execution_id: execution_id.to_string(),
            staging_prefix: ctx.staging_prefix().to_string(),
            store_location: self.store.location().to_string(),
            split_prefix,
            embedding_manifest: embedding.manifest_key.clone(),
            embedding: StageCounts::from(&embedding),
            search_results: search.object_key,
            extraction_manifest: extraction.manifest_key.clone(),
            extraction: StageCounts::from(&extraction),
            extraction_results: extraction
                .manifest
                .entries
                .iter()
                .map(|entry| entry.result_key.clone())
                .collect(),
            history,
        })
    }
}

fn to_payload<T: Serialize>(kind: InvocationKind, output: &T) -> Result<Value, InvocationFailure> {
    serde_json::to_value(output)
        .map_err(|e| InvocationFailure::new(kind, format!("unserializable output: {e}")))
}
