use std::time::Duration;

use serde::Serialize;

/// Point-in-time view of a pool. `active + idle == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    /// Most connections open at once since the peak was last reset
    pub peak_connections: usize,
    /// Current capacity, which `resize()` may have changed
    pub max_connections: usize,
    /// Callers blocked in `acquire()`
    pub waiting: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_errors: u64,
    /// Time callers have spent inside `acquire()`, successful or not
    pub total_wait: Duration,
    /// Present only for pools running the verification overlay
    pub verification: Option<VerificationMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationMetrics {
    /// Every failed re-validation so far, including those of evicted connections
    pub total_verification_failures: u64,
    /// Idle connections that would be probed before their next checkout
    pub connections_needing_verification: usize,
}

impl PoolMetrics {
    /// Active connections as a percentage of capacity.
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            return 0.0;
        }
        self.active_connections as f64 / self.max_connections as f64 * 100.0
    }
}

impl std::fmt::Display for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} connections ({} active, {} idle, {} waiting), created {}, destroyed {}, acquired {}, released {}, errors {}",
            self.total_connections,
            self.max_connections,
            self.active_connections,
            self.idle_connections,
            self.waiting,
            self.total_created,
            self.total_destroyed,
            self.total_acquired,
            self.total_released,
            self.total_errors
        )?;
        if let Some(ref verification) = self.verification {
            write!(
                f,
                ", verification failures {}, stale {}",
                verification.total_verification_failures,
                verification.connections_needing_verification
            )?;
        }
        Ok(())
    }
}
