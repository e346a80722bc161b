//! Error types for vodfetch core

use thiserror::Error;
use vodfetch_types::{FailureCategory, TaskError};

/// Errors that can occur in the download engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Authentication failed for {provider}: {message}")]
    AuthFailure { provider: String, message: String },

    #[error("Server rejected byte-range requests")]
    RangeUnsupported,

    #[error("Size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Host {host} kept throttling requests")]
    Throttled { host: String },

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout")]
    Timeout,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Check if this error is retryable at task level
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(e) => !e.is_builder(),
            EngineError::Timeout
            | EngineError::SizeMismatch { .. }
            | EngineError::Throttled { .. } => true,
            EngineError::ServerError { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    /// Errors that move a task straight to Failed without retries
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Io(_)
            | EngineError::AuthFailure { .. }
            | EngineError::InvalidUrl(_)
            | EngineError::Serialization(_) => true,
            EngineError::ServerError { .. } => !self.is_retryable(),
            _ => false,
        }
    }

    /// Reason category shown to the user
    pub fn category(&self) -> FailureCategory {
        match self {
            EngineError::Io(_) | EngineError::Serialization(_) => FailureCategory::Disk,
            EngineError::AuthFailure { .. } => FailureCategory::Auth,
            EngineError::ServerError { .. }
            | EngineError::RangeUnsupported
            | EngineError::Throttled { .. }
            | EngineError::InvalidUrl(_) => FailureCategory::Server,
            EngineError::Network(_)
            | EngineError::SizeMismatch { .. }
            | EngineError::Timeout
            | EngineError::Cancelled
            | EngineError::Unknown(_) => FailureCategory::Network,
        }
    }

    /// Convert into the user-facing failure record
    pub fn to_task_error(&self) -> TaskError {
        TaskError {
            category: self.category(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_errors_are_fatal() {
        let err = EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.category(), FailureCategory::Disk);
    }

    #[test]
    fn server_errors_split_on_status() {
        let busy = EngineError::ServerError { status: 503, message: "busy".into() };
        assert!(busy.is_retryable());
        assert!(!busy.is_fatal());

        let gone = EngineError::ServerError { status: 404, message: "gone".into() };
        assert!(!gone.is_retryable());
        assert!(gone.is_fatal());
        assert_eq!(gone.category(), FailureCategory::Server);
    }

    #[test]
    fn auth_failure_reports_auth_category() {
        let err = EngineError::AuthFailure {
            provider: "portal".into(),
            message: "bad credentials".into(),
        };
        let task_error = err.to_task_error();
        assert_eq!(task_error.category, FailureCategory::Auth);
        assert!(task_error.message.contains("portal"));
    }
}
