//! Staging store for the similarity extraction pipeline
//!
//! Every intermediate artifact of a run (split chunks, per-item results,
//! stage manifests, search results) lives in a key/prefix addressed object
//! store. Three backends are provided:
//! - **Memory**: process-local, used by tests and single-process runs
//! - **Local filesystem**: a directory tree, atomic writes via rename
//! - **Object storage (S3/MinIO)**: the production backend
//!
//! All backends give read-after-write consistency: a `list` issued after a
//! `put` has returned always includes the written key.
//!
//! # Example
//!
//! ```rust,no_run
//! use extraction_storage::{MemoryStagingStore, StagingStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = MemoryStagingStore::new();
//!
//!     store.put("run-1/split/", "chunk=0/items.json", b"[]").await?;
//!     let keys = store.list("run-1/split/").await?;
//!     let data = store.get("", &keys[0]).await?;
//!
//!     Ok(())
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub mod layout;
pub mod local_storage;
pub mod memory_storage;
pub mod object_storage;

pub use layout::{chunk_id_from_key, execution_id_from_key, write_chunks, StagingLayout};
pub use local_storage::LocalStagingStore;
pub use memory_storage::MemoryStagingStore;
pub use object_storage::{S3Config, S3StagingStore};

/// Default number of keys requested per listing page
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// One page of a prefix listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Full store keys on this page
    pub keys: Vec<String>,

    /// Token to pass back for the next page (`None` = listing exhausted)
    pub next: Option<String>,
}

/// Key/prefix addressed object store scoped by per-execution prefixes
#[async_trait::async_trait]
pub trait StagingStore: Send + Sync {
    /// Name of the backing bucket or root, handed to workers so they can
    /// address the same objects
    fn location(&self) -> &str;

    /// Store an object, returning its full key
    async fn put(&self, prefix: &str, key: &str, data: &[u8]) -> StorageResult<String>;

    /// Retrieve an object; fails with `NotFound` when absent
    async fn get(&self, prefix: &str, key: &str) -> StorageResult<Vec<u8>>;

    /// List one page of full keys starting with `prefix`
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: usize,
    ) -> StorageResult<ListPage>;

    /// Delete an object (deleting a missing object is not an error)
    async fn delete(&self, prefix: &str, key: &str) -> StorageResult<()>;

    /// List every key starting with `prefix`, following all pages
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation = None;
        loop {
            let page = self
                .list_page(prefix, continuation, DEFAULT_LIST_PAGE_SIZE)
                .await?;
            keys.extend(page.keys);
            match page.next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Check if an object exists
    async fn exists(&self, prefix: &str, key: &str) -> StorageResult<bool> {
        match self.get(prefix, key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Serialize `value` as JSON and store it
pub async fn put_json<T>(
    store: &dyn StagingStore,
    prefix: &str,
    key: &str,
    value: &T,
) -> StorageResult<String>
where
    T: Serialize + Sync + ?Sized,
{
    let data = serde_json::to_vec(value)?;
    store.put(prefix, key, &data).await
}

/// Retrieve an object and deserialize it from JSON
pub async fn get_json<T>(store: &dyn StagingStore, prefix: &str, key: &str) -> StorageResult<T>
where
    T: DeserializeOwned,
{
    let data = store.get(prefix, key).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Join a prefix and a key into a validated full object key.
///
/// An empty prefix means `key` is already a full key.
pub fn join_key(prefix: &str, key: &str) -> StorageResult<String> {
    let full = if prefix.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        prefix.to_string()
    } else if prefix.ends_with('/') {
        format!("{prefix}{key}")
    } else {
        format!("{prefix}/{key}")
    };
    validate_key(&full)?;
    Ok(full)
}

/// Validate a full object key
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.ends_with('/') {
        return Err(StorageError::InvalidKey(format!("'{key}' is not an object key")));
    }
    validate_prefix(key)
}

/// Validate a listing prefix (may be empty or end in `/`)
pub fn validate_prefix(prefix: &str) -> StorageResult<()> {
    if prefix.starts_with('/') {
        return Err(StorageError::InvalidKey(format!(
            "'{prefix}' must not start with '/'"
        )));
    }
    let segments: Vec<&str> = prefix.split('/').collect();
    let last = segments.len().saturating_sub(1);
    for (i, segment) in segments.iter().enumerate() {
        if *segment == "." || *segment == ".." {
            return Err(StorageError::InvalidKey(format!(
                "'{prefix}' contains a relative segment"
            )));
        }
        if segment.is_empty() && i != last {
            return Err(StorageError::InvalidKey(format!(
                "'{prefix}' contains an empty segment"
            )));
        }
    }
    Ok(())
}
