//! Worker error types.

use reel_genai::GenaiError;
use reel_media::MediaError;
use reel_queue::QueueError;
use reel_storage::StorageError;
use reel_store::StoreError;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Generation backend error: {0}")]
    GenerationBackend(#[source] GenaiError),

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Compose backend error: {0}")]
    ComposeBackend(#[from] MediaError),

    #[error("Publish backend error: {0}")]
    PublishBackend(#[source] GenaiError),

    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    #[error("{stage} stage timed out after {secs} seconds")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn generation(e: GenaiError) -> Self {
        Self::GenerationBackend(e)
    }

    pub fn publish(e: GenaiError) -> Self {
        Self::PublishBackend(e)
    }

    pub fn invalid_script(msg: impl Into<String>) -> Self {
        Self::InvalidScript(msg.into())
    }

    pub fn missing_artifact(key: impl Into<String>) -> Self {
        Self::MissingArtifact(key.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if error is retryable.
    ///
    /// Retryable failures leave the message pending for redelivery; the
    /// durable attempt counter bounds how often that happens.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::GenerationBackend(e) | WorkerError::PublishBackend(e) => e.is_retryable(),
            WorkerError::ComposeBackend(e) => e.is_retryable(),
            WorkerError::Store(e) => e.is_retryable(),
            WorkerError::Storage(e) => !matches!(e, StorageError::ConfigError(_)),
            WorkerError::InvalidScript(_)
            | WorkerError::MissingArtifact(_)
            | WorkerError::Timeout { .. }
            | WorkerError::Queue(_)
            | WorkerError::Io(_) => true,
            WorkerError::ConfigError(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_models::JobStatus;

    #[test]
    fn test_retry_classification() {
        assert!(WorkerError::Timeout { stage: "scene", secs: 10 }.is_retryable());
        assert!(WorkerError::invalid_script("too few scenes").is_retryable());
        assert!(WorkerError::generation(GenaiError::Status { status: 502, body: String::new() }).is_retryable());
        assert!(!WorkerError::generation(GenaiError::config("no key")).is_retryable());
        assert!(!WorkerError::from(StoreError::IllegalTransition {
            from: JobStatus::Complete,
            to: JobStatus::Composing,
        })
        .is_retryable());
    }
}
