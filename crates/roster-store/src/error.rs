//! Coordination store error types

use roster_api::path::InvalidPath;

/// Error type for coordination store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("session {0} expired")]
    SessionExpired(u64),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    InvalidPath(#[from] InvalidPath),

    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the store's retry policy should retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Unavailable("127.0.0.1:2181".to_string());
        assert_eq!(err.to_string(), "store unavailable: 127.0.0.1:2181");

        let err = StoreError::NodeNotFound("/services/orders".to_string());
        assert_eq!(err.to_string(), "node not found: /services/orders");

        let err = StoreError::SessionExpired(7);
        assert_eq!(err.to_string(), "session 7 expired");
    }

    #[test]
    fn test_retryable() {
        assert!(StoreError::Unavailable(String::new()).is_retryable());
        assert!(!StoreError::SessionExpired(1).is_retryable());
        assert!(!StoreError::NodeNotFound(String::new()).is_retryable());
        assert!(!StoreError::Closed.is_retryable());
    }

    #[test]
    fn test_from_invalid_path() {
        let err: StoreError = roster_api::path::validate("relative").unwrap_err().into();
        assert!(matches!(err, StoreError::InvalidPath(_)));
    }
}
