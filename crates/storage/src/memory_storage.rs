//! In-memory staging store
//!
//! Keys are held in a `BTreeMap`, so every key sharing a prefix forms one
//! contiguous range and listings come back in lexicographic order.

use crate::{join_key, validate_prefix, ListPage, StagingStore, StorageError, StorageResult};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-local staging store
#[derive(Clone, Default)]
pub struct MemoryStagingStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStagingStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the store holds no objects
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl StagingStore for MemoryStagingStore {
    fn location(&self) -> &str {
        "memory"
    }

    async fn put(&self, prefix: &str, key: &str, data: &[u8]) -> StorageResult<String> {
        let full_key = join_key(prefix, key)?;
        self.objects
            .write()
            .await
            .insert(full_key.clone(), data.to_vec());
        Ok(full_key)
    }

    async fn get(&self, prefix: &str, key: &str) -> StorageResult<Vec<u8>> {
        let full_key = join_key(prefix, key)?;
        self.objects
            .read()
            .await
            .get(&full_key)
            .cloned()
            .ok_or(StorageError::NotFound(full_key))
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        validate_prefix(prefix)?;
        let max_keys = max_keys.max(1);
        let objects = self.objects.read().await;

        let lower = match continuation.as_deref() {
            Some(token) => Bound::Excluded(token),
            None => Bound::Included(prefix),
        };

        let mut keys = Vec::with_capacity(max_keys.min(objects.len()));
        let mut has_more = false;
        for key in objects
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
        {
            if keys.len() == max_keys {
                has_more = true;
                break;
            }
            keys.push(key.clone());
        }

        let next = if has_more { keys.last().cloned() } else { None };
        Ok(ListPage { keys, next })
    }

    async fn delete(&self, prefix: &str, key: &str) -> StorageResult<()> {
        let full_key = join_key(prefix, key)?;
        self.objects.write().await.remove(&full_key);
        Ok(())
    }
}
