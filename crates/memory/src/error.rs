use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes of a memory operation.
///
/// Every variant leaves the knowledge store in its last-known-good state.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The completion or embedding service failed or timed out.
    #[error("model request failed: {0:#}")]
    Upstream(anyhow::Error),

    /// The model replied, but nothing in the reply parsed into an operation.
    #[error("model output could not be parsed into any operation")]
    MalformedOutput { raw: String },

    /// A durable write (temp file, fsync or rename) failed.
    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl MemoryError {
    /// Upstream failures are transient; retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }

    pub(crate) fn upstream(err: anyhow::Error) -> Self {
        Self::Upstream(err)
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }
}

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// A model fragment or plan operation that was dropped, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedOperation {
    pub fragment: String,
    pub reason: String,
}

impl SkippedOperation {
    pub fn new(fragment: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            reason: reason.into(),
        }
    }
}
