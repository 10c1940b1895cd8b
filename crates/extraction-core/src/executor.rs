//! Bounded-concurrency fan-out stage executor
//!
//! Items are pulled from an [`ItemSource`] in source order and kept in a
//! sliding window of at most `max_concurrency` in-flight tasks: each
//! completion immediately admits the next item. Completions are recorded in
//! the order they arrive. Successful outputs are written as individual
//! content-addressed objects; once every admitted item has resolved, a
//! single [`StageManifest`] is written under the stage output prefix.
//!
//! # Failure tolerance
//!
//! A stage fails when `failed / total * 100 > tolerated_failure_percentage`.
//! While items are still running, the ratio is only checked once the total
//! item count is known (the source is exhausted or reports an exact total),
//! except at zero tolerance, where the first failure is already decisive.
//! Once the threshold is provably exceeded no further items are admitted.
//! By default in-flight items are allowed to finish; with `fail_fast` they
//! are aborted.
//!
//! A panic inside an item's invocation or its result write is recorded as
//! that item's failure, so every manifest holds exactly one
//! [`FailureRecord`] per failed item.

use crate::cancel::CancellationHandle;
use crate::context::PipelineSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::invoker::InvocationFailure;
use crate::manifest::{
    FailureRecord, ManifestEntry, ResultRecord, StageManifest, WorkItemRef, WorkItemResult,
};
use crate::source::ItemSource;
use extraction_storage::{put_json, StagingStore, StorageError};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Fan-out width and failure policy for one stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanOutSettings {
    /// Maximum number of in-flight items (at least 1)
    pub max_concurrency: usize,

    /// Percentage of failed items the stage absorbs (0-100)
    pub tolerated_failure_percentage: f64,

    /// Abort in-flight items once the threshold is exceeded instead of
    /// letting them finish
    pub fail_fast: bool,
}

impl FanOutSettings {
    #[must_use]
    pub fn new(max_concurrency: usize, tolerated_failure_percentage: f64) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            tolerated_failure_percentage: tolerated_failure_percentage.clamp(0.0, 100.0),
            fail_fast: false,
        }
    }

    #[must_use]
    pub fn from_pipeline(settings: &PipelineSettings) -> Self {
        Self::new(
            settings.max_concurrency,
            settings.tolerated_failure_percentage,
        )
    }

    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Whether `failed` out of `total` items is over the tolerance
    fn exceeds(&self, failed: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        failed as f64 * 100.0 > self.tolerated_failure_percentage * total as f64
    }
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self::new(10, 0.0)
    }
}

/// Outcome of a completed stage
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Key the manifest was written to
    pub manifest_key: String,
    pub manifest: StageManifest,
}

/// Result of one in-flight task
struct Completion {
    item: WorkItemRef,
    result: WorkItemResult,
}

/// Completion-ordered accumulator, written only by the join loop
#[derive(Default)]
struct StageTally {
    entries: Vec<ManifestEntry>,
    failures: Vec<FailureRecord>,
    succeeded: usize,
    failed: usize,
}

impl StageTally {
    fn record(&mut self, stage: &str, completion: Completion) {
        let Completion { item, result } = completion;
        match result {
            WorkItemResult::Success { result_key } => {
                debug!(stage, index = item.index, key = %result_key, "Item succeeded");
                self.succeeded += 1;
                self.entries.push(ManifestEntry { item, result_key });
            }
            WorkItemResult::Failure { reason } => {
                warn!(stage, index = item.index, location = %item.location, %reason, "Item failed");
                self.failed += 1;
                self.failures.push(FailureRecord { item, reason });
            }
        }
    }

    fn resolved(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Aborts the wrapped task when dropped, so aborting a window slot also
/// stops the work running inside it
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs fan-out stages against a staging store
pub struct FanOutExecutor {
    store: Arc<dyn StagingStore>,
    settings: FanOutSettings,
}

impl FanOutExecutor {
    pub fn new(store: Arc<dyn StagingStore>, settings: FanOutSettings) -> Self {
        Self { store, settings }
    }

    #[must_use]
    pub fn settings(&self) -> &FanOutSettings {
        &self.settings
    }

    /// Run one stage to completion.
    ///
    /// `work` is called once per admitted item, in source order, and returns
    /// the item's future. Results and the manifest are written under
    /// `output_prefix`.
    pub async fn run<S, F, Fut>(
        &self,
        stage: &str,
        execution_id: &str,
        output_prefix: &str,
        mut source: S,
        mut work: F,
        cancel: &CancellationHandle,
    ) -> PipelineResult<StageReport>
    where
        S: ItemSource,
        F: FnMut(WorkItemRef) -> Fut,
        Fut: Future<Output = Result<Value, InvocationFailure>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled(format!(
                "stage '{stage}' not started"
            )));
        }

        let start = Instant::now();
        let max_concurrency = self.settings.max_concurrency.max(1);
        info!(
            stage,
            execution_id,
            max_concurrency,
            tolerated_failure_percentage = self.settings.tolerated_failure_percentage,
            "Starting fan-out stage"
        );

        let mut tasks: JoinSet<Result<Completion, StorageError>> = JoinSet::new();
        let mut tally = StageTally::default();
        let mut dispatched = 0usize;
        let mut source_done = false;
        let mut exceeded = false;

        loop {
            while !source_done && !exceeded && tasks.len() < max_concurrency {
                match source.next_item().await {
                    Ok(Some(item)) => {
                        debug!(stage, index = item.index, location = %item.location, "Dispatching item");
                        let invocation = work(item.clone());
                        tasks.spawn(Self::process_item(
                            Arc::clone(&self.store),
                            output_prefix.to_string(),
                            item,
                            invocation,
                        ));
                        dispatched += 1;
                    }
                    Ok(None) => source_done = true,
                    Err(e) => {
                        error!(stage, error = %e, "Failed to read stage input");
                        Self::shutdown(&mut tasks).await;
                        return Err(PipelineError::from(e).with_counts(tally.succeeded, tally.failed));
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    Self::shutdown(&mut tasks).await;
                    warn!(stage, execution_id, resolved = tally.resolved(), "Fan-out stage cancelled");
                    return Err(PipelineError::cancelled(format!(
                        "stage '{stage}' cancelled after {} of {dispatched} dispatched items resolved",
                        tally.resolved()
                    ))
                    .with_counts(tally.succeeded, tally.failed));
                }
                joined = tasks.join_next() => joined,
            };

            match joined {
                Some(Ok(Ok(completion))) => tally.record(stage, completion),
                Some(Ok(Err(e))) => {
                    error!(stage, error = %e, "Failed to store item result");
                    Self::shutdown(&mut tasks).await;
                    return Err(PipelineError::from(e).with_counts(tally.succeeded, tally.failed));
                }
                Some(Err(e)) if e.is_cancelled() => continue,
                Some(Err(e)) => {
                    // Item work runs in its own task, so only the slot wrapper
                    // is left to panic here and the item can't be attributed
                    error!(stage, error = %e, "Fan-out slot panicked");
                    Self::shutdown(&mut tasks).await;
                    return Err(PipelineError::StageFailure {
                        stage: stage.to_string(),
                        reason: format!("fan-out slot panicked: {e}"),
                        succeeded: tally.succeeded,
                        failed: tally.failed,
                        total: dispatched,
                    });
                }
                None => break,
            }

            if !exceeded {
                let known_total = if source_done {
                    Some(dispatched)
                } else {
                    source.total_hint()
                };
                let decisive = tally.failed > 0 && self.settings.tolerated_failure_percentage == 0.0;
                let over = known_total.is_some_and(|total| self.settings.exceeds(tally.failed, total));

                if decisive || over {
                    exceeded = true;
                    error!(
                        stage,
                        execution_id,
                        succeeded = tally.succeeded,
                        failed = tally.failed,
                        "Failure tolerance exceeded, no further items admitted"
                    );
                    if self.settings.fail_fast {
                        tasks.abort_all();
                    }
                }
            }
        }

        let total = if source_done {
            dispatched
        } else {
            source.total_hint().unwrap_or(dispatched).max(dispatched)
        };

        if exceeded || self.settings.exceeds(tally.failed, total) {
            let ratio = if total == 0 {
                0.0
            } else {
                tally.failed as f64 * 100.0 / total as f64
            };
            let mut reason = format!(
                "failure ratio {ratio:.1}% exceeds tolerated {:.1}%",
                self.settings.tolerated_failure_percentage
            );
            let unresolved = total.saturating_sub(tally.resolved());
            if unresolved > 0 {
                reason.push_str(&format!(", {unresolved} items not processed"));
            }
            return Err(PipelineError::StageFailure {
                stage: stage.to_string(),
                reason,
                succeeded: tally.succeeded,
                failed: tally.failed,
                total,
            });
        }

        let manifest = StageManifest {
            stage: stage.to_string(),
            execution_id: execution_id.to_string(),
            staging_location: output_prefix.to_string(),
            store_location: self.store.location().to_string(),
            entries: tally.entries,
            failures: tally.failures,
            succeeded: tally.succeeded,
            failed: tally.failed,
            total,
        };
        let manifest_key = manifest.write(self.store.as_ref()).await?;

        info!(
            stage,
            execution_id,
            succeeded = manifest.succeeded,
            failed = manifest.failed,
            total,
            duration_ms = start.elapsed().as_millis() as u64,
            manifest = %manifest_key,
            "Fan-out stage complete"
        );

        Ok(StageReport {
            manifest_key,
            manifest,
        })
    }

    /// Body of one window slot.
    ///
    /// The invocation and the result write run together in a worker task;
    /// the slot keeps its own copy of the item so that a panic in either
    /// still resolves to a failure for that item.
    async fn process_item<Fut>(
        store: Arc<dyn StagingStore>,
        output_prefix: String,
        item: WorkItemRef,
        invocation: Fut,
    ) -> Result<Completion, StorageError>
    where
        Fut: Future<Output = Result<Value, InvocationFailure>> + Send + 'static,
    {
        let worker_item = item.clone();
        let mut worker = AbortOnDrop(tokio::spawn(async move {
            let output = match invocation.await {
                Ok(output) => output,
                Err(failure) => {
                    return Ok(WorkItemResult::Failure {
                        reason: failure.reason,
                    })
                }
            };
            let record = ResultRecord {
                item: worker_item,
                output,
            };
            let key = record.key(&output_prefix)?;
            let result_key = put_json(store.as_ref(), "", &key, &record).await?;
            Ok::<_, StorageError>(WorkItemResult::Success { result_key })
        }));

        let result = match (&mut worker.0).await {
            Ok(result) => result?,
            Err(e) if e.is_panic() => WorkItemResult::Failure {
                reason: format!("worker panicked: {}", panic_message(e.into_panic().as_ref())),
            },
            Err(e) => WorkItemResult::Failure {
                reason: format!("worker did not complete: {e}"),
            },
        };
        Ok(Completion { item, result })
    }

    /// Abort every in-flight task and wait for them to stop
    async fn shutdown(tasks: &mut JoinSet<Result<Completion, StorageError>>) {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
