//! Turning pool metrics into usage samples for the controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pool::{ConnectionFactory, ConnectionPool, PoolMetrics};

use super::{SizingController, UsageSample};

/// Remembers the previous metrics snapshot so the next one can be turned
/// into per-interval rates.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    previous: PoolMetrics,
    since: Instant,
}

impl UsageWindow {
    pub fn new(baseline: PoolMetrics) -> Self {
        Self::starting_at(baseline, Instant::now())
    }

    pub fn starting_at(baseline: PoolMetrics, since: Instant) -> Self {
        Self {
            previous: baseline,
            since,
        }
    }

    pub fn sample(&mut self, current: PoolMetrics) -> UsageSample {
        self.sample_at(current, Instant::now())
    }

    /// Sample covering the interval since the previous call, then start a new one.
    ///
    /// `current` should come from [`ConnectionPool::interval_metrics`] so its
    /// peak covers exactly this interval.
    pub fn sample_at(&mut self, current: PoolMetrics, now: Instant) -> UsageSample {
        let prev = &self.previous;
        let acquired = current.total_acquired.saturating_sub(prev.total_acquired);
        let errors = current.total_errors.saturating_sub(prev.total_errors);
        let attempts = acquired + errors;
        let waited = current.total_wait.saturating_sub(prev.total_wait);
        let minutes = now.saturating_duration_since(self.since).as_secs_f64() / 60.0;

        let sample = UsageSample {
            average_wait_time_ms: if attempts == 0 {
                0.0
            } else {
                waited.as_secs_f64() * 1000.0 / attempts as f64
            },
            peak_connections: current.peak_connections.max(current.total_connections),
            utilization_rate: current.utilization().clamp(0.0, 100.0),
            error_rate: if attempts == 0 {
                0.0
            } else {
                errors as f64 / attempts as f64
            },
            requests_per_minute: if minutes > 0.0 {
                attempts as f64 / minutes
            } else {
                0.0
            },
        };

        self.previous = current;
        self.since = now;
        sample
    }
}

/// Feed `pool`'s usage into `controller` every `every` until the pool is
/// destroyed or `shutdown` fires.
pub fn spawn_usage_reporter<F: ConnectionFactory>(
    controller: Arc<SizingController>,
    name: impl Into<String>,
    pool: ConnectionPool<F>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let name = name.into();
    tokio::spawn(async move {
        let mut window = UsageWindow::new(pool.interval_metrics());
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = pool.closed() => break,
                _ = ticker.tick() => {
                    let sample = window.sample(pool.interval_metrics());
                    tracing::trace!(
                        pool = %name,
                        utilization = sample.utilization_rate,
                        wait_ms = sample.average_wait_time_ms,
                        error_rate = sample.error_rate,
                        peak = sample.peak_connections,
                        "Usage sample"
                    );
                    controller.update_pool_stats(&name, sample);
                }
            }
        }
    })
}
