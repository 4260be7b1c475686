//! Error types for generation and publishing backends.

use thiserror::Error;

/// Result type for backend calls.
pub type GenaiResult<T> = Result<T, GenaiError>;

#[derive(Debug, Error)]
pub enum GenaiError {
    #[error("Backend not configured: {0}")]
    Config(String),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenaiError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Whether the same request could succeed later.
    ///
    /// Rate limits, server errors and transport failures are transient.
    /// Malformed output from a model is retried too since generation is
    /// non-deterministic.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenaiError::Status { status, .. } => *status == 429 || *status >= 500,
            GenaiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            GenaiError::InvalidResponse(_) | GenaiError::Json(_) => true,
            GenaiError::Io(_) => true,
            GenaiError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let status = |status| GenaiError::Status {
            status,
            body: String::new(),
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!GenaiError::config("missing key").is_retryable());
        assert!(GenaiError::invalid_response("not json").is_retryable());
    }
}
