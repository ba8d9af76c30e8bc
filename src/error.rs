//! Errors returned by the synchronizer, the composer, and the upstream pool.

use support_harness_core::error::{ErrorClass, UpstreamError};
use thiserror::Error;

/// Outcome of a pooled upstream call that did not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every attempt failed, or the last failure was not retryable.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("upstream call cancelled")]
    Cancelled,
}

/// Errors that abort a whole synchronization pass.
///
/// Per-document failures never surface here; they are recorded in the
/// pass's `SyncReport` instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The source could not be read. Nothing was mutated.
    #[error("failed to fetch knowledge source: {0:#}")]
    Fetch(anyhow::Error),

    /// Persistence could not be read at boot.
    #[error("failed to load persisted sync state: {0:#}")]
    Restore(anyhow::Error),

    /// Another pass is already running.
    #[error("a synchronization pass is already in progress")]
    InProgress,

    /// The pass was cancelled. Documents committed before cancellation stay
    /// committed.
    #[error("synchronization cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Fetch(_) | SyncError::Restore(_) => ErrorClass::Fatal,
            SyncError::InProgress => ErrorClass::Validation,
            SyncError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Errors returned by `RetrievalComposer::answer`.
///
/// Upstream failures are not errors here: the composer degrades instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("invalid query: {0}")]
    Validation(String),

    #[error("answer cancelled")]
    Cancelled,
}

impl ComposeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ComposeError::Validation(_) => ErrorClass::Validation,
            ComposeError::Cancelled => ErrorClass::Cancelled,
        }
    }
}
