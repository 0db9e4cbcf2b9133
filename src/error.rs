//! Error types for the Outpost subsystem.

use std::time::Duration;
use thiserror::Error;

/// Retry discriminant for an upstream failure.
///
/// The discriminant is assigned at the point the upstream call fails and
/// carried on the error value itself, so retry decisions never have to
/// re-derive it from message text or status codes downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The upstream explicitly declared us over its rate limit (429).
    RateLimited,
    /// Network-level or server-side failure that is worth retrying.
    Transient,
    /// Anything else; retrying would produce the same outcome.
    Fatal,
}

/// An error produced while executing a governed upstream call.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    /// The upstream signalled "too many requests".
    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    /// Timeout, connection reset, DNS failure, or a 5xx response.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Validation or a non-rate-limit 4xx; never retried.
    #[error("upstream rejected request: {0}")]
    Fatal(String),

    /// The request queue was at capacity and the entry was shed.
    #[error("request queue at capacity ({0} entries)")]
    Overloaded(usize),

    /// The caller-supplied deadline elapsed before the call could complete.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl UpstreamError {
    /// The retry discriminant for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::RateLimited(_) => ErrorKind::RateLimited,
            UpstreamError::Transient(_) => ErrorKind::Transient,
            UpstreamError::Fatal(_)
            | UpstreamError::Overloaded(_)
            | UpstreamError::DeadlineExceeded(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the governor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Fatal
    }

    /// Classify an HTTP-style status code into a typed error.
    ///
    /// 429 is rate limiting, 5xx is transient, everything else is fatal.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => UpstreamError::RateLimited(message),
            500..=599 => UpstreamError::Transient(message),
            _ => UpstreamError::Fatal(message),
        }
    }
}

/// Errors raised while setting up the subsystem itself.
#[derive(Error, Debug)]
pub enum OutpostError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for setup operations.
pub type Result<T> = std::result::Result<T, OutpostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            UpstreamError::from_status(429, "slow down").kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            UpstreamError::from_status(503, "unavailable").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            UpstreamError::from_status(400, "bad request").kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            UpstreamError::from_status(404, "not found").kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_retryability() {
        assert!(UpstreamError::RateLimited("x".into()).is_retryable());
        assert!(UpstreamError::Transient("x".into()).is_retryable());
        assert!(!UpstreamError::Fatal("x".into()).is_retryable());
        assert!(!UpstreamError::Overloaded(1024).is_retryable());
        assert!(!UpstreamError::DeadlineExceeded(Duration::from_secs(5)).is_retryable());
    }
}
