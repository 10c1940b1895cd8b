//! Local filesystem staging store
//!
//! Objects are files under a root directory, one path segment per key
//! segment. Writes go to a scratch directory first and are renamed into
//! place, so readers never observe a partially written object.

use crate::{
    join_key, validate_prefix, ListPage, StagingStore, StorageError, StorageResult,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scratch directory for in-progress writes, excluded from listings
const SCRATCH_DIR: &str = ".staging-tmp";

/// Directory-backed staging store
#[derive(Debug, Clone)]
pub struct LocalStagingStore {
    root: PathBuf,
    location: String,
}

impl LocalStagingStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(SCRATCH_DIR)).await?;
        let location = root.display().to_string();
        Ok(Self { root, location })
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, full_key: &str) -> PathBuf {
        full_key
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    /// Collect every object key below `dir`, relative to the store root
    async fn walk(&self, dir: PathBuf) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![dir];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if path != self.root.join(SCRATCH_DIR) {
                        pending.push(path);
                    }
                } else if let Some(key) = self.key_for(&path) {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Option<Vec<&str>> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect();
        Some(segments?.join("/"))
    }
}

#[async_trait::async_trait]
impl StagingStore for LocalStagingStore {
    fn location(&self) -> &str {
        &self.location
    }

    async fn put(&self, prefix: &str, key: &str, data: &[u8]) -> StorageResult<String> {
        let full_key = join_key(prefix, key)?;
        let path = self.object_path(&full_key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let scratch = self
            .root
            .join(SCRATCH_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&scratch, data).await?;
        if let Err(e) = tokio::fs::rename(&scratch, &path).await {
            let _ = tokio::fs::remove_file(&scratch).await;
            return Err(e.into());
        }

        debug!(key = %full_key, bytes = data.len(), "Stored object");
        Ok(full_key)
    }

    async fn get(&self, prefix: &str, key: &str) -> StorageResult<Vec<u8>> {
        let full_key = join_key(prefix, key)?;
        match tokio::fs::read(self.object_path(&full_key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(full_key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        validate_prefix(prefix)?;
        let max_keys = max_keys.max(1);

        // Only the directory holding the last complete segment can contain matches
        let base = match prefix.rfind('/') {
            Some(idx) => self.object_path(&prefix[..idx]),
            None => self.root.clone(),
        };

        let mut keys: Vec<String> = self
            .walk(base)
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation.as_deref().map_or(true, |token| k.as_str() > token))
            .collect();
        keys.sort();

        let has_more = keys.len() > max_keys;
        keys.truncate(max_keys);
        let next = if has_more { keys.last().cloned() } else { None };
        Ok(ListPage { keys, next })
    }

    async fn delete(&self, prefix: &str, key: &str) -> StorageResult<()> {
        let full_key = join_key(prefix, key)?;
        match tokio::fs::remove_file(self.object_path(&full_key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
