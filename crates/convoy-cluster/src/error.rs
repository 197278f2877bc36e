//! Errors returned by collaborator clients.

use thiserror::Error;

/// Result type alias for collaborator calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Failure of a call to discovery, the controller, the cluster or a host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The remote end could not be reached or returned a server error.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    /// The remote end understood the request and refused it.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("stream closed")]
    StreamClosed,
}

impl ClientError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout | Self::StreamClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ClientError::Unavailable("503".to_string()).is_retryable());
        assert!(ClientError::Timeout.is_retryable());
        assert!(!ClientError::Rejected("bad job".to_string()).is_retryable());
        assert!(!ClientError::NotFound("job".to_string()).is_retryable());
    }
}
