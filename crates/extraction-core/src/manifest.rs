//! Fan-out work items and stage manifests

use extraction_storage::{get_json, put_json, StagingStore, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File name of a stage manifest under the stage output prefix
pub const MANIFEST_FILE: &str = "manifest.json";

/// Sub-prefix holding individual result objects
pub const RESULTS_DIR: &str = "results/";

/// Reference to one input of a fan-out stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemRef {
    /// Store key of the item (a chunk object, or the array holding it)
    pub location: String,

    /// Position in source order
    pub index: usize,

    /// Inline item data when the item is an element of a staged array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl WorkItemRef {
    pub fn new(location: impl Into<String>, index: usize) -> Self {
        Self {
            location: location.into(),
            index,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Outcome of one work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItemResult {
    /// Output stored as a [`ResultRecord`] at `result_key`
    Success { result_key: String },
    Failure { reason: String },
}

impl WorkItemResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Stored body of one successful item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub item: WorkItemRef,
    pub output: Value,
}

impl ResultRecord {
    /// Content-addressed key of this record under `output_prefix`
    pub fn key(&self, output_prefix: &str) -> StorageResult<String> {
        let bytes = serde_json::to_vec(self)?;
        let hash = blake3::hash(&bytes);
        Ok(format!("{output_prefix}{RESULTS_DIR}{}.json", hash.to_hex()))
    }
}

/// Successful item as exposed to the next stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub item: WorkItemRef,

    /// Store key of the item's [`ResultRecord`]
    pub result_key: String,
}

impl ManifestEntry {
    /// Fetch the result record this entry points at
    pub async fn load_result(&self, store: &dyn StagingStore) -> StorageResult<ResultRecord> {
        get_json(store, "", &self.result_key).await
    }
}

/// Failed item, kept for diagnostics only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub item: WorkItemRef,
    pub reason: String,
}

/// Durable record of a completed fan-out stage.
///
/// `entries` are in completion order and hold only successful items.
/// Consumers must treat that order as meaningless. Every failed item has
/// exactly one record in `failures`, so `failures.len() == failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage: String,
    pub execution_id: String,

    /// Stage output prefix the manifest and its results live under
    pub staging_location: String,

    /// Bucket or root of the store holding the results
    pub store_location: String,

    pub entries: Vec<ManifestEntry>,

    #[serde(default)]
    pub failures: Vec<FailureRecord>,

    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

impl StageManifest {
    /// Key the manifest is written to
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{MANIFEST_FILE}", self.staging_location)
    }

    /// Write the manifest with a single put, returning its key
    pub async fn write(&self, store: &dyn StagingStore) -> StorageResult<String> {
        put_json(store, "", &self.key(), self).await
    }

    /// Load a manifest written by a previous stage
    pub async fn load(store: &dyn StagingStore, key: &str) -> StorageResult<Self> {
        get_json(store, "", key).await
    }
}
