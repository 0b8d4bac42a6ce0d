//! Error types for LedgerFS
//!
//! One enum covers every failure class of the metadata engine. Callers
//! decide between retrying and giving up with [`Error::is_retryable`] and
//! [`Error::is_fatal`].

use thiserror::Error;

/// Common result type for LedgerFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for LedgerFS
#[derive(Debug, Error)]
pub enum Error {
    // Local storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    /// A flushed segment could not be made durable. The log can no longer
    /// promise that "flushed" means "on disk".
    #[error("durability failure: {0}")]
    Durability(String),

    // Replay errors
    #[error("transaction id gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    // Network errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    // Lifecycle
    #[error("shutting down")]
    ShuttingDown,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a durability error
    pub fn durability(msg: impl Into<String>) -> Self {
        Self::Durability(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Check if this is a transient error worth retrying next cycle
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed(_) | Self::Protocol(_)
        )
    }

    /// Check if this error means in-memory state can no longer be trusted
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Durability(_) | Self::SequenceGap { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::connection("refused").is_retryable());
        assert!(Error::protocol("bad ack").is_retryable());
        assert!(!Error::durability("fsync").is_retryable());
        assert!(!Error::ShuttingDown.is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::durability("fsync failed").is_fatal());
        assert!(
            Error::SequenceGap {
                expected: 5,
                found: 7
            }
            .is_fatal()
        );
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::storage("rename").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::SequenceGap {
            expected: 3,
            found: 9,
        };
        assert_eq!(err.to_string(), "transaction id gap: expected 3, found 9");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(err.to_string().starts_with("disk I/O error"));
    }
}
