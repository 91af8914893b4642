use std::collections::VecDeque;

use crate::constants::{
    SCALE_DOWN_FACTOR, SCALE_DOWN_WAIT_MS, SCALE_UP_FACTOR, SCALE_UP_MAX_ERROR_RATE,
    SCALE_UP_WAIT_MS, SIZING_MIN_SAMPLES,
};

use super::{DynamicPoolConfig, ScaleDirection, UsageSample};

/// Aggregate of a pool's recent samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub avg_wait_ms: f64,
    pub avg_utilization: f64,
    pub avg_error_rate: f64,
    pub avg_requests_per_minute: f64,
    /// Window maximum, not a mean
    pub peak_connections: usize,
}

impl WindowStats {
    /// `None` until enough samples have been collected to judge the pool.
    pub fn from_samples(samples: &VecDeque<UsageSample>) -> Option<Self> {
        if samples.len() < SIZING_MIN_SAMPLES {
            return None;
        }
        let n = samples.len() as f64;
        let mean = |f: fn(&UsageSample) -> f64| samples.iter().map(f).sum::<f64>() / n;

        Some(Self {
            avg_wait_ms: mean(|s| s.average_wait_time_ms),
            avg_utilization: mean(|s| s.utilization_rate),
            avg_error_rate: mean(|s| s.error_rate),
            avg_requests_per_minute: mean(|s| s.requests_per_minute),
            peak_connections: samples
                .iter()
                .map(|s| s.peak_connections)
                .max()
                .unwrap_or(0),
        })
    }
}

/// The maximum the rule proposes for `config`, or `None` to leave it alone.
pub(crate) fn propose_max(
    config: &DynamicPoolConfig,
    stats: &WindowStats,
) -> Option<(ScaleDirection, usize)> {
    let current = config.pool.max_connections;

    let proposed = if stats.avg_utilization > config.scale_up_threshold
        && stats.avg_wait_ms > SCALE_UP_WAIT_MS
        && stats.avg_error_rate < SCALE_UP_MAX_ERROR_RATE
    {
        let step = ceil_fraction(current, SCALE_UP_FACTOR).min(config.max_scale_up_steps);
        // A pool already above the effective range is never shrunk by the up rule
        (current + step)
            .min(config.max_effective_connections)
            .max(current)
    } else if stats.avg_utilization < config.scale_down_threshold
        && stats.avg_wait_ms < SCALE_DOWN_WAIT_MS
        && current > config.min_effective_connections
    {
        let step = ceil_fraction(current, SCALE_DOWN_FACTOR).max(1);
        current
            .saturating_sub(step)
            .max(config.min_effective_connections)
    } else {
        return None;
    };

    match proposed {
        p if p > current => Some((ScaleDirection::Up, p)),
        p if p < current => Some((ScaleDirection::Down, p)),
        _ => None,
    }
}

fn ceil_fraction(value: usize, fraction: f64) -> usize {
    (value as f64 * fraction).ceil() as usize
}
