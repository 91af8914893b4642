//! Re-validation overlay for transports whose sessions go stale between uses.
//!
//! SMTP servers drop idle sessions aggressively, so a pooled session that sat
//! idle for longer than `verification_interval` is probed before it is handed
//! out. A probe failure is reported to that caller; after
//! `max_verification_failures` consecutive failures the session is evicted.

use std::time::{Duration, Instant};

use super::PoolError;
use super::record::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationConfig {
    /// Idle sessions last verified at least this long ago are probed on checkout
    pub verification_interval: Duration,
    /// Consecutive probe failures that evict a session
    pub max_verification_failures: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            verification_interval: Duration::from_secs(30),
            max_verification_failures: 3,
        }
    }
}

/// What happens to a session after a failed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    /// Stays pooled, flagged for another probe
    Retain { failures: u32 },
    /// Crossed the threshold and must be destroyed
    Evict { failures: u32 },
}

impl VerificationConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_verification_failures == 0 {
            return Err(PoolError::InvalidConfig(
                "max_verification_failures must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn needs_verification<C>(&self, record: &Record<C>, now: Instant) -> bool {
        match record.last_verified_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.verification_interval,
        }
    }

    pub(crate) fn record_failure<C>(&self, record: &mut Record<C>) -> FailureOutcome {
        record.verification_failures = record.verification_failures.saturating_add(1);
        let failures = record.verification_failures;
        if failures >= self.max_verification_failures {
            FailureOutcome::Evict { failures }
        } else {
            FailureOutcome::Retain { failures }
        }
    }

    /// A healthy release clears the failure streak. An unhealthy one keeps it
    /// and forces a probe before the next checkout, so a persistent fault
    /// eventually reaches the eviction threshold.
    pub(crate) fn on_release<C>(&self, record: &mut Record<C>) {
        if record.healthy {
            record.verification_failures = 0;
        } else {
            record.last_verified_at = None;
            record.healthy = true;
        }
    }
}
