//! Extraction Core - building blocks of the similarity extraction pipeline
//!
//! This crate provides the execution context, the unit-of-work invoker
//! boundary, and the bounded-concurrency fan-out executor that the pipeline
//! coordinator runs twice (embedding, then extraction).

pub mod cancel;
pub mod context;
pub mod error;
pub mod executor;
pub mod invoker;
pub mod manifest;
pub mod source;

pub use cancel::CancellationHandle;
pub use context::{
    config_from_input, default_config, merge_defaults, new_execution_id, validate_execution_id,
    ConfigMap, ExecutionContext, PipelineSettings,
};
pub use error::{PipelineError, PipelineResult};
pub use executor::{FanOutExecutor, FanOutSettings, StageReport};
pub use invoker::{
    EmbedOutput, EmbedRequest, ExtractRequest, InvocationFailure, InvocationKind,
    InvocationResult, Invoker, SearchOutput, SearchRequest, SplitOutput, SplitRequest,
};
pub use manifest::{
    FailureRecord, ManifestEntry, ResultRecord, StageManifest, WorkItemRef, WorkItemResult,
};
pub use source::{ItemSource, JsonArrayItemSource, PrefixItemSource, VecItemSource};
