//! Job store error types.

use reel_models::{JobId, JobStatus};
use thiserror::Error;

/// Result type for job store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    /// Another invocation already moved the job on. Callers no-op.
    #[error("Stale state: expected {expected}, found {actual}")]
    StaleState {
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(job_id: &JobId) -> Self {
        Self::NotFound(job_id.clone())
    }

    pub fn stale(expected: JobStatus, actual: JobStatus) -> Self {
        Self::StaleState { expected, actual }
    }

    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// True for the benign "someone else already advanced it" signal.
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleState { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let stale = StoreError::stale(JobStatus::Composing, JobStatus::Publishing);
        assert!(stale.is_stale());
        assert!(!stale.is_retryable());
        assert_eq!(stale.to_string(), "Stale state: expected COMPOSING, found PUBLISHING");

        let missing = StoreError::not_found(&JobId::from_string("j1"));
        assert!(missing.is_not_found());
        assert!(!missing.is_stale());
    }
}
