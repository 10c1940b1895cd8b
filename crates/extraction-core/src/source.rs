//! Item sources feeding a fan-out stage
//!
//! Sources are pulled one item at a time so a stage never has to hold the
//! whole input in memory. A prefix listing is fetched page by page.

use crate::manifest::WorkItemRef;
use async_trait::async_trait;
use extraction_storage::{get_json, StagingStore, StorageResult, DEFAULT_LIST_PAGE_SIZE};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Ordered, pull-based stream of work items
#[async_trait]
pub trait ItemSource: Send {
    /// Next item in source order, `None` once exhausted
    async fn next_item(&mut self) -> StorageResult<Option<WorkItemRef>>;

    /// Exact total item count, when known
    fn total_hint(&self) -> Option<usize> {
        None
    }
}

/// Items already held in memory
#[derive(Debug, Clone, Default)]
pub struct VecItemSource {
    items: VecDeque<WorkItemRef>,
    total: usize,
}

impl VecItemSource {
    #[must_use]
    pub fn new(items: Vec<WorkItemRef>) -> Self {
        let total = items.len();
        Self {
            items: items.into(),
            total,
        }
    }
}

#[async_trait]
impl ItemSource for VecItemSource {
    async fn next_item(&mut self) -> StorageResult<Option<WorkItemRef>> {
        Ok(self.items.pop_front())
    }

    fn total_hint(&self) -> Option<usize> {
        Some(self.total)
    }
}

/// Every object under a staging prefix, one item per key
pub struct PrefixItemSource {
    store: Arc<dyn StagingStore>,
    prefix: String,
    page_size: usize,
    buffered: VecDeque<String>,
    continuation: Option<String>,
    listing_done: bool,
    next_index: usize,
}

impl PrefixItemSource {
    pub fn new(store: Arc<dyn StagingStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            page_size: DEFAULT_LIST_PAGE_SIZE,
            buffered: VecDeque::new(),
            continuation: None,
            listing_done: false,
            next_index: 0,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn fetch_page(&mut self) -> StorageResult<()> {
        let page = self
            .store
            .list_page(&self.prefix, self.continuation.take(), self.page_size)
            .await?;

        debug!(prefix = %self.prefix, keys = page.keys.len(), "Listed page");

        // Directory markers are not items
        self.buffered
            .extend(page.keys.into_iter().filter(|k| !k.ends_with('/')));
        self.listing_done = page.next.is_none();
        self.continuation = page.next;
        Ok(())
    }
}

#[async_trait]
impl ItemSource for PrefixItemSource {
    async fn next_item(&mut self) -> StorageResult<Option<WorkItemRef>> {
        loop {
            if let Some(key) = self.buffered.pop_front() {
                let item = WorkItemRef::new(key, self.next_index);
                self.next_index += 1;
                return Ok(Some(item));
            }
            if self.listing_done {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    fn total_hint(&self) -> Option<usize> {
        self.listing_done
            .then(|| self.next_index + self.buffered.len())
    }
}

/// Elements of one staged JSON array, each carried inline as the payload
#[derive(Debug, Clone)]
pub struct JsonArrayItemSource {
    inner: VecItemSource,
}

impl JsonArrayItemSource {
    /// Read the array stored at `key`
    pub async fn load(store: &dyn StagingStore, key: &str) -> StorageResult<Self> {
        let elements: Vec<Value> = get_json(store, "", key).await?;
        let items = elements
            .into_iter()
            .enumerate()
            .map(|(index, element)| WorkItemRef::new(key, index).with_payload(element))
            .collect();
        Ok(Self {
            inner: VecItemSource::new(items),
        })
    }
}

#[async_trait]
impl ItemSource for JsonArrayItemSource {
    async fn next_item(&mut self) -> StorageResult<Option<WorkItemRef>> {
        self.inner.next_item().await
    }

    fn total_hint(&self) -> Option<usize> {
        self.inner.total_hint()
    }
}
