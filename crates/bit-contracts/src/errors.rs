//! # Error Types
//!
//! Errors a bit can return to the host.

use axum::http::StatusCode;
use thiserror::Error;

/// Failure of a bit operation. Converted to an HTTP status by the router.
#[derive(Debug, Clone, Error)]
pub enum BitError {
    /// The requested resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was malformed or failed validation.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The bit failed while handling an otherwise valid request.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The bit does not support the operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl BitError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn bad_request(err: impl std::fmt::Display) -> Self {
        Self::BadRequest(err.to_string())
    }

    /// HTTP status this error maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl From<serde_json::Error> for BitError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

/// Errors from the host's periodic task scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Task already registered: {0}")]
    Duplicate(String),

    #[error("Task interval must be greater than zero: {0}")]
    ZeroInterval(String),

    #[error("Scheduler is shut down")]
    ShutDown,

    #[error("No async runtime available to drive task {0}")]
    NoRuntime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(BitError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(BitError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            BitError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_json_error_is_bad_request() {
        let err: BitError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, BitError::BadRequest(_)));
    }
}
