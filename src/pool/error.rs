//! Errors surfaced to pool callers.
//!
//! Each variant tells the caller whether trying again can help; see
//! [`PoolError::is_retryable`]. Errors from closing a connection never show up
//! here because the pool logs and absorbs them.

use std::time::Duration;

use super::RecordId;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The factory or the post-create liveness check kept failing.
    #[error("pool `{pool}`: could not create a connection after {attempts} attempts: {source}")]
    CreationFailed {
        pool: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Every slot stayed busy for the whole wait budget.
    #[error("pool `{pool}`: no connection became available within {waited:?}")]
    AcquireTimeout { pool: String, waited: Duration },

    /// An idle connection failed its re-validation probe; it stays pooled.
    #[error("pool `{pool}`: connection {record} failed verification ({failures} consecutive failures)")]
    VerificationFailed {
        pool: String,
        record: RecordId,
        failures: u32,
    },

    /// A connection crossed the failure threshold and was evicted.
    #[error("pool `{pool}`: connection {record} evicted after {failures} failed verifications")]
    VerificationExceeded {
        pool: String,
        record: RecordId,
        failures: u32,
    },

    #[error("pool `{pool}` is closed")]
    Closed { pool: String },

    /// A connection was handed back to a pool that never lent it.
    #[error("pool `{pool}` does not own connection {record}")]
    NotOwned { pool: String, record: RecordId },

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether repeating the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout { .. } | Self::VerificationFailed { .. }
        )
    }

    /// Misuse of the pool API rather than a runtime failure.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::NotOwned { .. } | Self::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = PoolError::AcquireTimeout {
            pool: "imap".to_string(),
            waited: Duration::from_millis(50),
        };
        assert!(timeout.is_retryable());

        let failed = PoolError::VerificationFailed {
            pool: "smtp".to_string(),
            record: RecordId(1),
            failures: 1,
        };
        assert!(failed.is_retryable());

        let exceeded = PoolError::VerificationExceeded {
            pool: "smtp".to_string(),
            record: RecordId(1),
            failures: 3,
        };
        assert!(!exceeded.is_retryable());

        let closed = PoolError::Closed {
            pool: "imap".to_string(),
        };
        assert!(!closed.is_retryable());
    }

    #[test]
    fn test_not_owned_is_programming_error() {
        let err = PoolError::NotOwned {
            pool: "imap".to_string(),
            record: RecordId(7),
        };
        assert!(err.is_programming_error());
        assert_eq!(err.to_string(), "pool `imap` does not own connection #7");
    }

    #[test]
    fn test_creation_failed_keeps_source() {
        let err = PoolError::CreationFailed {
            pool: "imap".to_string(),
            attempts: 3,
            source: anyhow::anyhow!("connection refused"),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection refused"));
        assert!(!err.is_retryable());
    }
}
