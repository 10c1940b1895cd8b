//! End-to-end pipeline scenarios
//!
//! Every test drives the real coordinator against the in-memory staging
//! store with a scripted invoker standing in for the external workers.
//!
//! Run: cargo test --test pipeline_scenarios

use async_trait::async_trait;
use extraction_core::{
    merge_defaults, CancellationHandle, ConfigMap, EmbedOutput,
    EmbedRequest, ExtractRequest, InvocationFailure, InvocationKind, InvocationResult, Invoker,
    PipelineError, SearchOutput, SearchRequest, SplitOutput, SplitRequest, StageManifest,
};
use extraction_orchestrator::{Coordinator, CoordinatorOptions, PipelineState};
use extraction_storage::{
    chunk_id_from_key, put_json, write_chunks, MemoryStagingStore, StagingLayout, StagingStore,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const EMBEDDING_MANIFEST_SUFFIX: &str = "embedding/output/manifest.json";

/// What the search worker does with a manifest that has no entries
#[derive(Clone, Copy, PartialEq)]
enum EmptySearch {
    Accept,
    Reject,
}

struct ScriptedInvoker {
    store: Arc<MemoryStagingStore>,
    chunks: usize,
    failing_chunks: HashSet<usize>,
    embed_delay: Duration,
    empty_search: EmptySearch,
    split_outside_prefix: bool,

    /// Report a search results key without writing the object
    search_skips_write: bool,

    /// Released by the test to let a blocked split finish
    split_gate: Option<Arc<Notify>>,
    split_started: Arc<Notify>,

    in_flight: AtomicUsize,
    peak: AtomicUsize,
    embed_calls: AtomicUsize,
    search_calls: AtomicUsize,
    search_manifest_sizes: Mutex<Vec<usize>>,
    extract_requests: Mutex<Vec<ExtractRequest>>,
}

impl ScriptedInvoker {
    fn new(store: Arc<MemoryStagingStore>, chunks: usize) -> Self {
        Self {
            store,
            chunks,
            failing_chunks: HashSet::new(),
            embed_delay: Duration::from_millis(5),
            empty_search: EmptySearch::Accept,
            split_outside_prefix: false,
            search_skips_write: false,
            split_gate: None,
            split_started: Arc::new(Notify::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            search_manifest_sizes: Mutex::new(Vec::new()),
            extract_requests: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, chunks: impl IntoIterator<Item = usize>) -> Self {
        self.failing_chunks = chunks.into_iter().collect();
        self
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn split(&self, request: SplitRequest) -> InvocationResult<SplitOutput> {
        self.split_started.notify_one();
        if let Some(gate) = &self.split_gate {
            gate.notified().await;
        }

        let layout = if self.split_outside_prefix {
            StagingLayout::from_prefix("shared/")
        } else {
            StagingLayout::from_prefix(request.staging_prefix)
        };
        let lines: Vec<String> = (0..self.chunks).map(|i| format!("paragraph {i}")).collect();
        let key_prefix = write_chunks(self.store.as_ref(), &layout, &lines, 1)
            .await
            .map_err(|e| InvocationFailure::new(InvocationKind::Split, e.to_string()))?;

        Ok(SplitOutput {
            key_prefix,
            bucket: Some(self.store.location().to_string()),
        })
    }

    async fn embed(&self, request: EmbedRequest) -> InvocationResult<EmbedOutput> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.embed_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let chunk = chunk_id_from_key(&request.chunk.location).and_then(|c| c.parse::<usize>().ok());
        if chunk.is_some_and(|c| self.failing_chunks.contains(&c)) {
            return Err(InvocationFailure::new(
                InvocationKind::Embed,
                "embedding model unavailable",
            ));
        }

        Ok(EmbedOutput {
            bucket: Some(self.store.location().to_string()),
            object_key: Some(request.chunk.location.replace("items.json", "embeddings.json")),
        })
    }

    async fn search(&self, request: SearchRequest) -> InvocationResult<SearchOutput> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let fail = |reason: String| InvocationFailure::new(InvocationKind::Search, reason);

        let manifest = StageManifest::load(self.store.as_ref(), &request.manifest_key)
            .await
            .map_err(|e| fail(e.to_string()))?;
        self.search_manifest_sizes
            .lock()
            .unwrap()
            .push(manifest.entries.len());

        if manifest.entries.is_empty() && self.empty_search == EmptySearch::Reject {
            return Err(fail("no embedded chunks to search".to_string()));
        }

        let selected: Vec<Value> = manifest
            .entries
            .iter()
            .take(request.max_results as usize)
            .map(|entry| json!({"chunk": entry.item.location, "query": request.query}))
            .collect();

        let run_prefix = request
            .manifest_key
            .strip_suffix(EMBEDDING_MANIFEST_SUFFIX)
            .ok_or_else(|| fail(format!("unexpected manifest key {}", request.manifest_key)))?;
        let layout = StagingLayout::from_prefix(run_prefix);
        let object_key = if self.search_skips_write {
            layout.search_results_key()
        } else {
            put_json(self.store.as_ref(), "", &layout.search_results_key(), &selected)
                .await
                .map_err(|e| fail(e.to_string()))?
        };

        Ok(SearchOutput {
            bucket: request.bucket,
            object_key,
        })
    }

    async fn extract(&self, request: ExtractRequest) -> InvocationResult<Value> {
        let output = json!({"source": request.item["chunk"], "fields": {"clause": "..."}});
        self.extract_requests.lock().unwrap().push(request);
        Ok(output)
    }
}

fn input(overrides: Value) -> Value {
    let mut base = json!({
        "query": "payment terms",
        "model": "extractor-large",
        "schema": {"type": "object", "properties": {"clause": {"type": "string"}}},
        "instructions": "Return the clause verbatim"
    });
    if let (Some(base), Some(overrides)) = (base.as_object_mut(), overrides.as_object()) {
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
    }
    base
}

type Harness = (Coordinator, Arc<ScriptedInvoker>, Arc<MemoryStagingStore>);

fn setup(invoker: impl FnOnce(Arc<MemoryStagingStore>) -> ScriptedInvoker) -> Harness {
    setup_with_options(invoker, CoordinatorOptions::default())
}

fn setup_with_options(
    invoker: impl FnOnce(Arc<MemoryStagingStore>) -> ScriptedInvoker,
    options: CoordinatorOptions,
) -> Harness {
    let store = Arc::new(MemoryStagingStore::new());
    let invoker = Arc::new(invoker(Arc::clone(&store)));
    let coordinator = Coordinator::with_options(store.clone(), invoker.clone(), options);
    (coordinator, invoker, store)
}

#[tokio::test]
async fn scenario_a_all_embeddings_succeed() {
    let (coordinator, invoker, store) = setup(|store| ScriptedInvoker::new(store, 5));

    let outcome = coordinator
        .execute_with("scenario-a", input(json!({"max_concurrency": 2})), &CancellationHandle::new())
        .await
        .unwrap();

    let manifest = StageManifest::load(store.as_ref(), &outcome.embedding_manifest)
        .await
        .unwrap();
    assert_eq!(manifest.entries.len(), 5);
    assert_eq!(manifest.succeeded + manifest.failed, manifest.total);
    assert!(invoker.peak.load(Ordering::SeqCst) <= 2);

    let embedding = outcome
        .history
        .iter()
        .position(|s| *s == PipelineState::EmbeddingFanOut)
        .unwrap();
    assert_eq!(outcome.history[embedding + 1], PipelineState::SimilaritySearch);
    assert_eq!(outcome.history.last(), Some(&PipelineState::Done));
}

#[tokio::test]
async fn scenario_b_failures_over_tolerance_fail_the_run() {
    let (coordinator, invoker, _) =
        setup(|store| ScriptedInvoker::new(store, 10).failing([1, 4, 7]));

    let failure = coordinator
        .execute_with(
            "scenario-b",
            input(json!({"tolerated_failure_percentage": 20})),
            &CancellationHandle::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::EmbeddingFanOut);
    assert!(matches!(failure.error, PipelineError::StageFailure { .. }));
    assert_eq!(failure.failed, 3);
    assert_eq!(invoker.search_calls.load(Ordering::SeqCst), 0);

    let status = coordinator.run_status("scenario-b").await.unwrap();
    assert_eq!(status.state, PipelineState::Failed);
    assert_eq!(status.failed_in, Some(PipelineState::EmbeddingFanOut));
}

#[tokio::test]
async fn scenario_b_failures_within_tolerance_are_skipped() {
    let (coordinator, invoker, store) =
        setup(|store| ScriptedInvoker::new(store, 10).failing([1, 4, 7]));

    let outcome = coordinator
        .execute_with(
            "scenario-b-ok",
            input(json!({"tolerated_failure_percentage": 30, "similarity_search_max_results": 20})),
            &CancellationHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.embedding.succeeded, 7);
    assert_eq!(outcome.embedding.failed, 3);
    // Search only ever sees successful entries
    assert_eq!(*invoker.search_manifest_sizes.lock().unwrap(), vec![7]);
    assert_eq!(outcome.extraction.total, 7);

    let manifest = StageManifest::load(store.as_ref(), &outcome.embedding_manifest)
        .await
        .unwrap();
    assert_eq!(manifest.entries.len(), manifest.succeeded);
    assert_eq!(manifest.failures.len(), 3);
}

#[tokio::test]
async fn scenario_c_no_chunks_reaches_search_with_empty_manifest() {
    let (coordinator, invoker, _) = setup(|store| ScriptedInvoker::new(store, 0));

    let outcome = coordinator
        .execute_with("scenario-c", input(json!({})), &CancellationHandle::new())
        .await
        .unwrap();

    assert_eq!(outcome.embedding.total, 0);
    assert_eq!(*invoker.search_manifest_sizes.lock().unwrap(), vec![0]);
    assert_eq!(outcome.extraction.total, 0);
    assert!(outcome.extraction_results.is_empty());
    assert_eq!(outcome.history.last(), Some(&PipelineState::Done));
}

#[tokio::test]
async fn scenario_c_search_may_reject_empty_manifest() {
    let (coordinator, _, _) = setup(|store| {
        let mut invoker = ScriptedInvoker::new(store, 0);
        invoker.empty_search = EmptySearch::Reject;
        invoker
    });

    let failure = coordinator
        .execute_with("scenario-c-reject", input(json!({})), &CancellationHandle::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::SimilaritySearch);
    assert_eq!(failure.error.kind(), "stage_failure");
    assert!(failure.error.to_string().contains("no embedded chunks"));
}

#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let store = Arc::new(MemoryStagingStore::new());
    let coordinator = Coordinator::new(
        store.clone(),
        Arc::new(ScriptedInvoker::new(Arc::clone(&store), 6)),
    );
    let cancel = CancellationHandle::new();

    let (first, second) = tokio::join!(
        coordinator.execute_with("run-left", input(json!({})), &cancel),
        coordinator.execute_with("run-right", input(json!({})), &cancel),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_ne!(first.staging_prefix, second.staging_prefix);
    assert_ne!(first.embedding_manifest, second.embedding_manifest);

    for outcome in [&first, &second] {
        let manifest = StageManifest::load(store.as_ref(), &outcome.embedding_manifest)
            .await
            .unwrap();
        assert_eq!(manifest.execution_id, outcome.execution_id);
        assert_eq!(manifest.entries.len(), 6);
        for entry in &manifest.entries {
            assert!(entry.item.location.starts_with(&outcome.staging_prefix));
            assert!(entry.result_key.starts_with(&outcome.staging_prefix));
        }
        for key in store.list(&outcome.staging_prefix).await.unwrap() {
            assert!(key.contains(&format!("execution_id={}/", outcome.execution_id)));
        }
    }
}

#[tokio::test]
async fn active_execution_id_cannot_be_reused() {
    let gate = Arc::new(Notify::new());
    let (coordinator, invoker, _) = setup({
        let gate = Arc::clone(&gate);
        move |store| {
            let mut invoker = ScriptedInvoker::new(store, 2);
            invoker.split_gate = Some(gate);
            invoker
        }
    });
    let cancel = CancellationHandle::new();

    let first = coordinator.execute_with("shared-id", input(json!({})), &cancel);
    let second = async {
        invoker.split_started.notified().await;
        let result = coordinator
            .execute_with("shared-id", input(json!({})), &cancel)
            .await;
        assert_eq!(coordinator.active_runs().await, vec!["shared-id".to_string()]);
        gate.notify_one();
        result
    };

    let (first, second) = tokio::join!(first, second);
    assert!(first.is_ok());
    let failure = second.unwrap_err();
    assert_eq!(failure.error.kind(), "configuration");
    assert!(failure.error.to_string().contains("already running"));
}

#[tokio::test]
async fn finished_execution_id_is_not_reused() {
    let store = Arc::new(MemoryStagingStore::new());
    let coordinator = Coordinator::new(
        store.clone(),
        Arc::new(ScriptedInvoker::new(Arc::clone(&store), 5)),
    );
    let cancel = CancellationHandle::new();
    let first = coordinator
        .execute_with("same", input(json!({})), &cancel)
        .await
        .unwrap();
    assert_eq!(first.embedding.total, 5);

    let failure = coordinator
        .execute_with("same", input(json!({})), &cancel)
        .await
        .unwrap_err();
    assert_eq!(failure.state, PipelineState::Defaulting);
    assert_eq!(failure.error.kind(), "configuration");

    // A fresh coordinator over the same store has no registry entry, but
    // the leftover chunks still keep the id from being used again
    let smaller = Arc::new(ScriptedInvoker::new(Arc::clone(&store), 2));
    let restarted = Coordinator::new(store.clone(), smaller.clone());
    let failure = restarted
        .execute_with("same", input(json!({})), &cancel)
        .await
        .unwrap_err();
    assert_eq!(failure.error.kind(), "configuration");
    assert!(failure.error.to_string().contains(&first.staging_prefix));
    assert_eq!(smaller.embed_calls.load(Ordering::SeqCst), 0);

    let manifest = StageManifest::load(store.as_ref(), &first.embedding_manifest)
        .await
        .unwrap();
    assert_eq!(manifest.total, 5);
}

#[tokio::test(start_paused = true)]
async fn dropped_run_is_marked_failed() {
    let (coordinator, _, _) = setup(|store| {
        let mut invoker = ScriptedInvoker::new(store, 3);
        invoker.embed_delay = Duration::from_secs(600);
        invoker
    });

    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        coordinator.execute_with("dropped", input(json!({})), &CancellationHandle::new()),
    )
    .await;
    assert!(abandoned.is_err());

    assert!(coordinator.active_runs().await.is_empty());
    let status = coordinator.run_status("dropped").await.unwrap();
    assert_eq!(status.state, PipelineState::Failed);
    assert_eq!(status.failed_in, Some(PipelineState::EmbeddingFanOut));
    assert!(status.error.unwrap().contains("abandoned"));

    // No longer "already running"; split output is what blocks the id now
    let failure = coordinator
        .execute_with("dropped", input(json!({})), &CancellationHandle::new())
        .await
        .unwrap_err();
    assert!(!failure.error.to_string().contains("already running"));
    assert!(failure.error.to_string().contains("already used"));
    assert!(coordinator.forget("dropped").await);
}

#[tokio::test]
async fn unreadable_search_results_fail_extraction() {
    let (coordinator, invoker, _) = setup(|store| {
        let mut invoker = ScriptedInvoker::new(store, 3);
        invoker.search_skips_write = true;
        invoker
    });

    let failure = coordinator
        .execute_with("missing-results", input(json!({})), &CancellationHandle::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::ExtractionFanOut);
    assert_eq!(failure.error.kind(), "store_consistency");
    assert!(invoker.extract_requests.lock().unwrap().is_empty());

    let status = coordinator.run_status("missing-results").await.unwrap();
    assert_eq!(status.failed_in, Some(PipelineState::ExtractionFanOut));
    assert_eq!(status.embedding.unwrap().succeeded, 3);
}

#[tokio::test(start_paused = true)]
async fn cancelled_fan_out_reports_resolved_items() {
    let (coordinator, _, _) = setup(|store| {
        let mut invoker = ScriptedInvoker::new(store, 4);
        invoker.embed_delay = Duration::from_millis(10);
        invoker
    });
    let cancel = CancellationHandle::new();

    let (result, ()) = tokio::join!(
        coordinator.execute_with("interrupted", input(json!({"max_concurrency": 1})), &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            cancel.cancel();
        },
    );

    let failure = result.unwrap_err();
    assert_eq!(failure.state, PipelineState::EmbeddingFanOut);
    assert_eq!(failure.error.kind(), "cancelled");
    assert_eq!((failure.succeeded, failure.failed), (2, 0));
}

#[tokio::test(start_paused = true)]
async fn concurrency_one_dispatches_sequentially() {
    let (coordinator, invoker, _) = setup(|store| ScriptedInvoker::new(store, 6));

    coordinator
        .execute_with("sequential", input(json!({"max_concurrency": 1})), &CancellationHandle::new())
        .await
        .unwrap();

    assert_eq!(invoker.embed_calls.load(Ordering::SeqCst), 6);
    assert_eq!(invoker.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_tolerance_fails_on_first_failure() {
    let (coordinator, _, _) = setup(|store| ScriptedInvoker::new(store, 8).failing([3]));

    let failure = coordinator
        .execute_with("zero-tolerance", input(json!({"max_concurrency": 1})), &CancellationHandle::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::EmbeddingFanOut);
    assert_eq!(failure.failed, 1);
}

#[tokio::test]
async fn full_tolerance_never_fails_the_stage() {
    let (coordinator, invoker, _) = setup(|store| ScriptedInvoker::new(store, 4).failing(0..4));

    let outcome = coordinator
        .execute_with(
            "full-tolerance",
            input(json!({"tolerated_failure_percentage": 100})),
            &CancellationHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.embedding.failed, 4);
    assert_eq!(*invoker.search_manifest_sizes.lock().unwrap(), vec![0]);
    assert_eq!(outcome.history.last(), Some(&PipelineState::Done));
}

#[tokio::test]
async fn extraction_settings_are_broadcast_to_every_item() {
    let (coordinator, invoker, store) = setup(|store| ScriptedInvoker::new(store, 9));

    let outcome = coordinator
        .execute_with(
            "broadcast",
            input(json!({"similarity_search_max_results": 4, "max_concurrency": 3})),
            &CancellationHandle::new(),
        )
        .await
        .unwrap();

    let requests = invoker.extract_requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 4);
    for request in &requests {
        assert_eq!(request.execution_id, "broadcast");
        assert_eq!(request.model, "extractor-large");
        assert_eq!(request.instructions, "Return the clause verbatim");
        assert_eq!(request.schema["properties"]["clause"]["type"], json!("string"));
        assert_eq!(request.item["query"], json!("payment terms"));
    }

    // Each extraction result is individually addressable
    assert_eq!(outcome.extraction_results.len(), 4);
    for key in &outcome.extraction_results {
        assert!(store.exists("", key).await.unwrap());
    }
}

#[tokio::test]
async fn split_output_outside_run_prefix_is_rejected() {
    let (coordinator, invoker, _) = setup(|store| {
        let mut invoker = ScriptedInvoker::new(store, 3);
        invoker.split_outside_prefix = true;
        invoker
    });

    let failure = coordinator
        .execute_with("escaping", input(json!({})), &CancellationHandle::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::Split);
    assert_eq!(failure.error.kind(), "stage_failure");
    assert_eq!(invoker.embed_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn run_deadline_cancels_the_run() {
    let options = CoordinatorOptions {
        run_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let (coordinator, _, _) = setup_with_options(
        |store| {
            let mut invoker = ScriptedInvoker::new(store, 3);
            invoker.embed_delay = Duration::from_secs(600);
            invoker
        },
        options,
    );

    let failure = coordinator
        .execute_with("slow", input(json!({})), &CancellationHandle::new())
        .await
        .unwrap_err();

    assert_eq!(failure.error.kind(), "cancelled");
    assert_eq!(failure.state, PipelineState::EmbeddingFanOut);
}

#[test]
fn defaulting_is_a_shallow_caller_wins_merge() {
    let as_map = |value: Value| -> ConfigMap { value.as_object().cloned().unwrap_or_default() };
    let defaults = as_map(json!({"a": 1, "b": 2}));
    let caller = as_map(json!({"b": 3, "c": 4}));

    let merged = merge_defaults(&defaults, &caller);
    assert_eq!(Value::Object(merged.clone()), json!({"a": 1, "b": 3, "c": 4}));
    assert_eq!(merge_defaults(&defaults, &merged), merged);
}
