//! Staging key layout
//!
//! Every object written during one run lives under
//! `date=YYYY-MM-DD/execution_id=<id>/`. Stages write below that prefix:
//!
//! ```text
//! date=2024-05-01/execution_id=<id>/
//!   split/chunk=<n>/items.json
//!   embedding/output/results/<hash>.json
//!   embedding/output/manifest.json
//!   search/results.json
//!   extraction/output/results/<hash>.json
//!   extraction/output/manifest.json
//! ```

use crate::{put_json, StagingStore, StorageResult};
use chrono::{NaiveDate, Utc};
use serde::Serialize;

const EXECUTION_SEGMENT: &str = "execution_id=";
const CHUNK_SEGMENT: &str = "chunk=";

/// Key layout for one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    prefix: String,
}

impl StagingLayout {
    /// Layout for an execution partitioned under `date`
    #[must_use]
    pub fn new(execution_id: &str, date: NaiveDate) -> Self {
        Self {
            prefix: format!(
                "date={}/{EXECUTION_SEGMENT}{execution_id}/",
                date.format("%Y-%m-%d")
            ),
        }
    }

    /// Layout for an execution started today (UTC)
    #[must_use]
    pub fn today(execution_id: &str) -> Self {
        Self::new(execution_id, Utc::now().date_naive())
    }

    /// Rebuild a layout from a previously computed staging prefix
    #[must_use]
    pub fn from_prefix(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    /// Execution-scoped staging prefix (ends with `/`)
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix under which the split stage writes chunk objects
    #[must_use]
    pub fn split_prefix(&self) -> String {
        format!("{}split/", self.prefix)
    }

    /// Key of one split chunk
    #[must_use]
    pub fn chunk_key(&self, index: usize) -> String {
        format!("{}{CHUNK_SEGMENT}{index}/items.json", self.split_prefix())
    }

    /// Output prefix of a fan-out stage (results and manifest)
    #[must_use]
    pub fn stage_output_prefix(&self, stage: &str) -> String {
        format!("{}{stage}/output/", self.prefix)
    }

    /// Key where the similarity search stage writes its selection
    #[must_use]
    pub fn search_results_key(&self) -> String {
        format!("{}search/results.json", self.prefix)
    }

    /// Whether `key` lies inside this execution's namespace
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        key.starts_with(&self.prefix) && key.len() > self.prefix.len()
    }
}

fn segment_value<'a>(key: &'a str, segment: &str) -> Option<&'a str> {
    key.split('/')
        .find_map(|part| part.strip_prefix(segment))
        .filter(|value| !value.is_empty())
}

/// Extract the `execution_id=` segment value from a staging key
#[must_use]
pub fn execution_id_from_key(key: &str) -> Option<&str> {
    segment_value(key, EXECUTION_SEGMENT)
}

/// Extract the `chunk=` segment value from a staging key
#[must_use]
pub fn chunk_id_from_key(key: &str) -> Option<&str> {
    segment_value(key, CHUNK_SEGMENT)
}

/// Write `items` as fixed-size chunk objects under the layout's split prefix.
///
/// Returns the split prefix, which is what a split worker hands back to the
/// pipeline.
pub async fn write_chunks<T>(
    store: &dyn StagingStore,
    layout: &StagingLayout,
    items: &[T],
    chunk_size: usize,
) -> StorageResult<String>
where
    T: Serialize + Sync,
{
    for (index, chunk) in items.chunks(chunk_size.max(1)).enumerate() {
        put_json(store, "", &layout.chunk_key(index), chunk).await?;
    }
    Ok(layout.split_prefix())
}
