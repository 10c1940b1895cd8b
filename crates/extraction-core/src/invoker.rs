//! Unit-of-work invoker boundary
//!
//! The per-item worker logic (splitting, embedding, ranking, extraction) is
//! external. The pipeline reaches it through [`Invoker`], a capability trait
//! with one method per invocation kind. Payloads are snake_case JSON, so a
//! process-backed invoker can pass them through unchanged.

use crate::manifest::WorkItemRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Kind of unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    Split,
    Embed,
    Search,
    Extract,
}

impl InvocationKind {
    pub const ALL: [InvocationKind; 4] = [Self::Split, Self::Embed, Self::Search, Self::Extract];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Split => "split",
            Self::Embed => "embed",
            Self::Search => "search",
            Self::Extract => "extract",
        }
    }
}

impl fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of work failed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} invocation failed: {reason}")]
pub struct InvocationFailure {
    pub kind: InvocationKind,
    pub reason: String,
}

impl InvocationFailure {
    pub fn new(kind: InvocationKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Result type for invocations
pub type InvocationResult<T> = Result<T, InvocationFailure>;

/// Split the source document into chunk objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub execution_id: String,

    /// Execution-scoped prefix the chunks must be written under
    pub staging_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitOutput {
    /// Prefix under which chunk objects were written
    pub key_prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

/// Embed one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub execution_id: String,
    pub chunk: WorkItemRef,
}

/// Location of a chunk's embeddings.
///
/// `object_key` is `None` when the chunk had nothing to embed; the search
/// stage skips such entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedOutput {
    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default)]
    pub object_key: Option<String>,
}

/// Rank embedded chunks against the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub bucket: String,
    pub manifest_key: String,
    pub execution_id: String,
    pub query: String,
    pub max_results: u32,
}

/// Location of a JSON array holding the selected candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutput {
    pub bucket: String,
    pub object_key: String,
}

/// Run extraction over one selected candidate.
///
/// `model`, `schema` and `instructions` are broadcast unchanged to every item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub item: Value,
    pub execution_id: String,
    pub model: String,
    pub schema: Value,
    pub instructions: String,
}

/// External executor of units of work.
///
/// Each call is independent and safe to retry. The pipeline never retries on
/// its own; retries, timeouts and backoff belong to implementations.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn split(&self, request: SplitRequest) -> InvocationResult<SplitOutput>;

    async fn embed(&self, request: EmbedRequest) -> InvocationResult<EmbedOutput>;

    /// Must handle an empty manifest (no chunks were embedded) and decide
    /// whether that is a success with zero candidates or a failure.
    async fn search(&self, request: SearchRequest) -> InvocationResult<SearchOutput>;

    /// Result is opaque to the pipeline
    async fn extract(&self, request: ExtractRequest) -> InvocationResult<Value>;
}
