//! Error types for Haybale
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for Haybale operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Haybale
#[derive(Debug, Error)]
pub enum Error {
    // Store errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("store is full: required {required} bytes, available {available} bytes")]
    StoreFull { required: u64, available: u64 },

    #[error("photo not found: {0}")]
    NotFound(u64),

    #[error("needle corrupt at volume {volume_id} offset {offset}")]
    Corrupt { volume_id: u32, offset: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // Directory errors
    #[error("not the directory leader")]
    NotLeader { leader: Option<String> },

    #[error("insufficient stores for placement: have {available}, need {required}")]
    InsufficientStores { available: usize, required: usize },

    // Network / RPC errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited")]
    RateLimited,

    // Coordination errors
    #[error("coordination store error: {0}")]
    Coordination(String),

    #[error("leader lease lost")]
    LeaseLost,

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a coordination error
    pub fn coordination(msg: impl Into<String>) -> Self {
        Self::Coordination(msg.into())
    }

    /// Check if this is a retryable (transient) error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Unavailable(_)
                | Self::ConnectionFailed(_)
                | Self::Coordination(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this replica should be treated as missing for replication
    ///
    /// Corrupt and checksum-failed reads count as a missing replica, not a
    /// client-visible distinction.
    #[must_use]
    pub fn is_missing_replica(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Corrupt { .. } | Self::ChecksumMismatch { .. }
        )
    }

    /// HTTP status code for the wire interfaces
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::NotFound(_) | Self::Corrupt { .. } | Self::ChecksumMismatch { .. } => 404,
            Self::RateLimited => 429,
            Self::DiskIo(_) | Self::Serialization(_) | Self::Internal(_) => 500,
            Self::NotLeader { .. }
            | Self::StoreFull { .. }
            | Self::InsufficientStores { .. }
            | Self::ConnectionFailed(_)
            | Self::Timeout
            | Self::Unavailable(_)
            | Self::Coordination(_)
            | Self::LeaseLost => 503,
        }
    }

    /// Reconstruct an error from an HTTP status returned by a peer
    #[must_use]
    pub fn from_status(status: u16, photo_id: u64, body: &str) -> Self {
        match status {
            404 => Self::NotFound(photo_id),
            429 => Self::RateLimited,
            503 => Self::Unavailable(body.to_string()),
            _ => Self::Internal(format!("peer returned {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Unavailable("test".into()).is_retryable());
        assert!(!Error::NotFound(1).is_retryable());
        assert!(!Error::RateLimited.is_retryable());
    }

    #[test]
    fn test_error_missing_replica() {
        assert!(Error::NotFound(1).is_missing_replica());
        assert!(Error::Corrupt {
            volume_id: 0,
            offset: 8,
        }
        .is_missing_replica());
        assert!(!Error::Timeout.is_missing_replica());
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::NotFound(1).http_status_code(), 404);
        assert_eq!(Error::RateLimited.http_status_code(), 429);
        assert_eq!(Error::NotLeader { leader: None }.http_status_code(), 503);
        assert_eq!(Error::Internal("x".into()).http_status_code(), 500);
    }
}
