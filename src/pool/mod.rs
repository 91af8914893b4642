//! Connection pooling for stateful mail protocol sessions.
//!
//! This module is split into:
//! - `factory.rs` - The capability trait a connection kind implements
//! - `connection_pool.rs` - Bounded pool with FIFO waiters and a background reaper
//! - `record.rs` - Per-connection bookkeeping and the checked-out guard
//! - `verification.rs` - Re-validation overlay for transports that go stale between uses
//! - `metrics.rs` - Read-only metrics snapshots
//! - `retry.rs` - Fixed-delay retry used when creating connections
//! - `error.rs` - Typed errors surfaced to pool callers

mod connection_pool;
mod error;
mod factory;
mod metrics;
mod record;
mod retry;
mod verification;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use connection_pool::{ConnectionPool, VerifyReport};
pub use error::PoolError;
pub use factory::ConnectionFactory;
pub use metrics::{PoolMetrics, VerificationMetrics};
pub use record::{PooledConnection, RecordId};
pub use verification::VerificationConfig;

/// The protocol a pool carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// IMAP sessions (mailbox access).
    MessageStore,
    /// SMTP sessions (outgoing mail).
    MailTransfer,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageStore => write!(f, "imap"),
            Self::MailTransfer => write!(f, "smtp"),
        }
    }
}

/// Sizing and timing parameters for one pool instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// The reaper never shrinks the pool below this many records
    pub min_connections: usize,
    /// Upper bound on records, idle plus checked out
    pub max_connections: usize,
    /// How long `acquire()` may wait for capacity
    pub acquire_timeout: Duration,
    /// Idle records untouched for longer than this are not handed out and get reaped
    pub idle_timeout: Duration,
    /// Extra creation attempts after the first one fails
    pub max_retries: u32,
    /// Fixed delay between creation attempts
    pub retry_delay: Duration,
    /// Reaper tick
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            health_check_interval: Duration::from_secs(6),
        }
    }
}

impl PoolConfig {
    /// Check the invariants the pool relies on.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.min_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "min_connections must be greater than zero".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "health_check_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_min_above_max() {
        let config = PoolConfig {
            min_connections: 5,
            max_connections: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_zero_sizes() {
        let zero_max = PoolConfig {
            max_connections: 0,
            ..PoolConfig::default()
        };
        assert!(zero_max.validate().is_err());

        let zero_min = PoolConfig {
            min_connections: 0,
            ..PoolConfig::default()
        };
        assert!(zero_min.validate().is_err());
    }

    #[test]
    fn test_connection_kind_display() {
        assert_eq!(ConnectionKind::MessageStore.to_string(), "imap");
        assert_eq!(ConnectionKind::MailTransfer.to_string(), "smtp");
    }
}
