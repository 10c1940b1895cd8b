//! Error types for the extraction pipeline

use extraction_storage::StorageError;
use thiserror::Error;

/// Failure kinds that can end a pipeline run.
///
/// Single work-item failures are not listed here: they are
/// [`InvocationFailure`](crate::InvocationFailure) values, counted by the
/// fan-out executor and only escalate to `StageFailure` when a stage exceeds
/// its failure tolerance.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stage '{stage}' failed: {reason} ({succeeded} succeeded, {failed} failed of {total})")]
    StageFailure {
        stage: String,
        reason: String,
        succeeded: usize,
        failed: usize,
        total: usize,
    },

    /// Staging data could not be listed, read or written. The counts are
    /// the items already resolved when it happened inside a fan-out.
    #[error("Store consistency error: {source}")]
    StoreConsistency {
        #[source]
        source: StorageError,
        succeeded: usize,
        failed: usize,
    },

    #[error("Run cancelled: {reason}")]
    Cancelled {
        reason: String,
        succeeded: usize,
        failed: usize,
    },
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        Self::StoreConsistency {
            source,
            succeeded: 0,
            failed: 0,
        }
    }
}

impl PipelineError {
    /// Stage failure of a single-invocation stage
    pub fn single_stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            reason: reason.into(),
            succeeded: 0,
            failed: 1,
            total: 1,
        }
    }

    /// Cancellation outside any fan-out
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
            succeeded: 0,
            failed: 0,
        }
    }

    /// Attach the item tally of an interrupted fan-out. Stage failures
    /// already carry their own counts and are returned unchanged.
    #[must_use]
    pub fn with_counts(self, succeeded: usize, failed: usize) -> Self {
        match self {
            Self::StoreConsistency { source, .. } => Self::StoreConsistency {
                source,
                succeeded,
                failed,
            },
            Self::Cancelled { reason, .. } => Self::Cancelled {
                reason,
                succeeded,
                failed,
            },
            other => other,
        }
    }

    /// Short machine-readable kind name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::StageFailure { .. } => "stage_failure",
            Self::StoreConsistency { .. } => "store_consistency",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Succeeded and failed item counts carried by the error, if any
    #[must_use]
    pub fn item_counts(&self) -> (usize, usize) {
        match self {
            Self::StageFailure {
                succeeded, failed, ..
            }
            | Self::StoreConsistency {
                succeeded, failed, ..
            }
            | Self::Cancelled {
                succeeded, failed, ..
            } => (*succeeded, *failed),
            Self::Configuration(_) => (0, 0),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
