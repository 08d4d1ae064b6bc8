//! The error taxonomy shared by every component in this crate.
//!
//! Leaf components return a [`CoreError`] tagged with an [`ErrorKind`]; the
//! scheduler is the sole place that matches on the kind to decide
//! retry-vs-terminal. Application-level callers (the CLI) propagate these
//! with `anyhow::Result` and `.context()`, same as the teacher's own
//! library/application split.

use thiserror::Error;

/// Stable classification of a failure, used to drive retry and
/// surface a consistent `errorCode` to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    RateLimited,
    ResourceExhausted,
    ConfigurationError,
    PermissionDenied,
    InvalidInput,
    InternalError,
    Cancelled,
    NotFound,
    PreconditionFailed,
}

impl ErrorKind {
    /// Only these kinds are eligible for the scheduler's automatic retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimited | Self::InternalError
        )
    }

    /// Stable machine-readable code surfaced on `Run.errorCode`.
    pub fn code(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ConfigurationError => "configuration_error",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidInput => "invalid_input",
            Self::InternalError => "internal_error",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::PreconditionFailed => "precondition_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Typed error carrying a stable [`ErrorKind`] plus a human-readable
/// message, returned from the public boundary of this crate's components.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::InternalError.is_retryable());
        assert!(!ErrorKind::ConfigurationError.is_retryable());
        assert!(!ErrorKind::InvalidInput.is_retryable());
        assert!(!ErrorKind::PermissionDenied.is_retryable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorKind::RateLimited.code(), "rate_limited");
        assert_eq!(ErrorKind::NotFound.code(), "not_found");
    }

    #[test]
    fn core_error_displays_kind_and_message() {
        let err = CoreError::not_found("run abc123 not found");
        assert_eq!(err.to_string(), "not_found: run abc123 not found");
    }
}
