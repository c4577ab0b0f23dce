//! Common error types for SehatLink offline storage and sync.

use thiserror::Error;

/// Top-level error type for offline storage and sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local storage cannot be opened or written (quota exceeded, disabled).
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The remote authority rejected or failed a single change submission.
    #[error("Remote submit failed: {0}")]
    RemoteSubmit(String),

    /// A ledger entry is unreadable or its payload is malformed.
    #[error("Ledger corruption: {0}")]
    LedgerCorruption(String),

    /// An operation did not finish within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Network transport failed.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The attached session is older than its allowed lifetime.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::Timeout("submit".to_string()).is_transient());
        assert!(!Error::RemoteSubmit("rejected".to_string()).is_transient());
        assert!(!Error::StorageUnavailable("quota".to_string()).is_transient());
    }

    #[test]
    fn test_display_names_the_failure() {
        let err = Error::StorageUnavailable("quota exceeded".to_string());
        assert_eq!(err.to_string(), "Storage unavailable: quota exceeded");
    }
}
