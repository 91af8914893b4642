//! Adaptive pool sizing.
//!
//! This module is split into:
//! - `controller.rs` - Registry of named pools, periodic scaling decisions
//! - `window.rs` - Rolling-window statistics and the scaling rule
//! - `usage.rs` - Turning pool metrics into usage samples

mod controller;
mod usage;
mod window;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pool::{
    ConnectionFactory, ConnectionKind, ConnectionPool, PoolConfig, PoolError, VerificationConfig,
};

pub use controller::SizingController;
pub use usage::{UsageWindow, spawn_usage_reporter};
pub use window::WindowStats;

/// Pool configuration plus the bounds the controller may move it within.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicPoolConfig {
    pub pool: PoolConfig,
    /// Re-validation overlay, used by transports whose sessions go stale
    pub verification: Option<VerificationConfig>,
    pub adaptive_scaling: bool,
    /// Informational; the controller acts on the two thresholds below
    pub target_utilization: f64,
    /// Mean utilization (percent) above which the pool may grow
    pub scale_up_threshold: f64,
    /// Mean utilization (percent) below which the pool may shrink
    pub scale_down_threshold: f64,
    /// Most connections one scale-up may add
    pub max_scale_up_steps: usize,
    /// Cooldown after any applied change, in either direction
    pub scale_down_delay: Duration,
    pub min_effective_connections: usize,
    pub max_effective_connections: usize,
}

impl DynamicPoolConfig {
    /// Starting point for a pool of the given kind.
    pub fn recommended(kind: ConnectionKind) -> Self {
        let (max_connections, max_effective, idle_timeout, verification) = match kind {
            ConnectionKind::MessageStore => (3, 8, Duration::from_secs(300), None),
            ConnectionKind::MailTransfer => (
                2,
                5,
                Duration::from_secs(60),
                Some(VerificationConfig::default()),
            ),
        };

        Self {
            pool: PoolConfig {
                min_connections: 1,
                max_connections,
                acquire_timeout: Duration::from_millis(3000),
                idle_timeout,
                max_retries: 5,
                retry_delay: Duration::from_millis(200),
                health_check_interval: Duration::from_millis(6000),
            },
            verification,
            adaptive_scaling: true,
            target_utilization: 70.0,
            scale_up_threshold: 85.0,
            scale_down_threshold: 40.0,
            max_scale_up_steps: 2,
            scale_down_delay: Duration::from_millis(120_000),
            min_effective_connections: 1,
            max_effective_connections: max_effective,
        }
    }

    /// Check the pool settings and that `max_connections` lies within the
    /// effective range.
    pub fn validate(&self) -> Result<(), PoolError> {
        self.pool.validate()?;
        if self.min_effective_connections > self.max_effective_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_effective_connections ({}) exceeds max_effective_connections ({})",
                self.min_effective_connections, self.max_effective_connections
            )));
        }
        let max = self.pool.max_connections;
        if max < self.min_effective_connections || max > self.max_effective_connections {
            return Err(PoolError::InvalidConfig(format!(
                "max_connections ({}) outside the effective range [{}, {}]",
                max, self.min_effective_connections, self.max_effective_connections
            )));
        }
        Ok(())
    }

    /// Pull `max_connections` into the effective range. Returns the old value
    /// if it had to move.
    pub(crate) fn clamp_to_effective_range(&mut self) -> Option<usize> {
        let max = self.pool.max_connections;
        let clamped = max
            .min(self.max_effective_connections)
            .max(self.min_effective_connections)
            .max(self.pool.min_connections);
        if clamped == max {
            return None;
        }
        self.pool.max_connections = clamped;
        Some(max)
    }

    /// Build a live pool from this configuration.
    pub fn build_pool<F: ConnectionFactory>(
        &self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<ConnectionPool<F>, PoolError> {
        match self.verification {
            Some(ref verification) => ConnectionPool::with_verification(
                name,
                self.pool.clone(),
                verification.clone(),
                factory,
            ),
            None => ConnectionPool::new(name, self.pool.clone(), factory),
        }
    }
}

/// One observation of a pool's load over a reporting interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageSample {
    pub average_wait_time_ms: f64,
    pub peak_connections: usize,
    /// Percent of capacity in use, 0 to 100
    pub utilization_rate: f64,
    /// Fraction of acquire attempts that failed, 0 to 1
    pub error_rate: f64,
    pub requests_per_minute: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// An applied change to a pool's maximum, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleDecision {
    pub pool: String,
    pub direction: ScaleDirection,
    pub old_max: usize,
    pub new_max: usize,
    pub avg_utilization: f64,
    pub avg_wait_ms: f64,
    pub avg_error_rate: f64,
    pub peak_connections: usize,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::MockFactory;

    #[test]
    fn test_recommended_seeds() {
        let imap = DynamicPoolConfig::recommended(ConnectionKind::MessageStore);
        assert_eq!(imap.pool.max_connections, 3);
        assert_eq!(
            (imap.min_effective_connections, imap.max_effective_connections),
            (1, 8)
        );
        assert!(imap.verification.is_none());

        let smtp = DynamicPoolConfig::recommended(ConnectionKind::MailTransfer);
        assert_eq!(smtp.pool.max_connections, 2);
        assert_eq!(
            (smtp.min_effective_connections, smtp.max_effective_connections),
            (1, 5)
        );
        assert_eq!(smtp.verification, Some(VerificationConfig::default()));

        for config in [&imap, &smtp] {
            assert_eq!(config.pool.acquire_timeout, Duration::from_secs(3));
            assert_eq!(config.pool.max_retries, 5);
            assert_eq!(config.scale_down_delay, Duration::from_secs(120));
            assert_eq!(config.max_scale_up_steps, 2);
            assert!(config.pool.validate().is_ok());
        }
    }

    #[test]
    fn test_validate_effective_range() {
        let mut config = DynamicPoolConfig::recommended(ConnectionKind::MessageStore);
        assert!(config.validate().is_ok());

        config.pool.max_connections = 10;
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));

        config.pool.max_connections = 3;
        config.min_effective_connections = 9;
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_clamp_to_effective_range() {
        let mut config = DynamicPoolConfig::recommended(ConnectionKind::MessageStore);
        assert_eq!(config.clamp_to_effective_range(), None);

        config.pool.max_connections = 10;
        assert_eq!(config.clamp_to_effective_range(), Some(10));
        assert_eq!(config.pool.max_connections, 8);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_build_pool_applies_overlay() {
        let smtp = DynamicPoolConfig::recommended(ConnectionKind::MailTransfer);
        let pool = smtp.build_pool("smtp", MockFactory::new()).unwrap();
        assert!(pool.metrics().verification.is_some());
        assert_eq!(pool.max_connections(), 2);
        pool.destroy().await;

        let imap = DynamicPoolConfig::recommended(ConnectionKind::MessageStore);
        let pool = imap.build_pool("imap", MockFactory::new()).unwrap();
        assert!(pool.metrics().verification.is_none());
        pool.destroy().await;
    }
}
