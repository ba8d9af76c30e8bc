//! Error types shared by the core and the application crate.
//!
//! Every error maps onto one [`ErrorClass`], which decides how callers react:
//! validation errors are rejected immediately, upstream errors are retried and
//! then degraded, consistency errors are logged and self-healed.

use thiserror::Error;

/// Coarse error taxonomy used for retry, degradation, and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input. Never retried.
    Validation,
    /// Embedder or generator failure. Retried with backoff, then degraded.
    Upstream,
    /// Index and sync state diverged. Logged and repaired on the next pass.
    Consistency,
    /// Signature verification failed. No side effects, no detail.
    Security,
    /// The caller cancelled the operation or its deadline elapsed.
    Cancelled,
    /// The operation cannot proceed at all (e.g. the source fetch failed).
    Fatal,
}

/// Errors produced by the chunker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("document {doc_id} has no content")]
    EmptyDocument { doc_id: String },

    #[error("invalid chunking parameters: max_chunk_size={max_chunk_size}, overlap={overlap}")]
    InvalidParameters { max_chunk_size: usize, overlap: usize },
}

impl ChunkError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Errors produced by the vector index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk {chunk_id} has a non-finite vector component")]
    NonFiniteVector { chunk_id: String },

    #[error("chunk {chunk_id} belongs to {actual}, not {expected}")]
    ForeignChunk {
        chunk_id: String,
        expected: String,
        actual: String,
    },
}

impl IndexError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Consistency
    }
}

/// Failure of an external capability (embedder or generator).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Network-level failure (connect, reset, TLS).
    #[error("{service} transport error: {message}")]
    Transport { service: String, message: String },

    /// Non-success HTTP status.
    #[error("{service} returned {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    /// A single attempt exceeded its deadline.
    #[error("{service} timed out")]
    Timeout { service: String },

    /// The response could not be interpreted.
    #[error("{service} returned an invalid response: {message}")]
    InvalidResponse { service: String, message: String },

    /// The capability is not usable as configured (missing key, disabled).
    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },
}

impl UpstreamError {
    /// Whether another attempt may succeed.
    ///
    /// Rate limits, server errors, timeouts, and transport failures are
    /// transient. Client errors and unusable responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport { .. } | UpstreamError::Timeout { .. } => true,
            UpstreamError::Status { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::InvalidResponse { .. } | UpstreamError::Unavailable { .. } => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::Upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> UpstreamError {
        UpstreamError::Status {
            service: "embedder".to_string(),
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn test_rate_limit_and_server_errors_are_retryable() {
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        let invalid = UpstreamError::InvalidResponse {
            service: "generator".to_string(),
            message: "no choices".to_string(),
        };
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn test_timeouts_are_retryable() {
        let e = UpstreamError::Timeout {
            service: "embedder".to_string(),
        };
        assert!(e.is_retryable());
        assert_eq!(e.class(), ErrorClass::Upstream);
    }
}
