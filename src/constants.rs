//! Application-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

// === Sizing controller ===

/// Usage samples kept per pool; older samples fall off the front.
pub const SIZING_HISTORY_LIMIT: usize = 10;

/// A pool needs at least this many samples before the controller judges it.
pub const SIZING_MIN_SAMPLES: usize = 3;

/// Mean wait above which a busy pool is considered starved.
pub const SCALE_UP_WAIT_MS: f64 = 1000.0;

/// Mean wait below which a quiet pool may give capacity back.
pub const SCALE_DOWN_WAIT_MS: f64 = 500.0;

/// Error rate at or above which the controller refuses to grow a pool.
/// Failures caused by the server are not fixed by opening more sessions.
pub const SCALE_UP_MAX_ERROR_RATE: f64 = 0.1;

/// Fraction of the current maximum added by one scale-up step.
pub const SCALE_UP_FACTOR: f64 = 0.5;

/// Fraction of the current maximum removed by one scale-down step.
pub const SCALE_DOWN_FACTOR: f64 = 0.25;

/// Controller tick in seconds.
pub const SIZING_TICK_SECS: u64 = 30;

/// How often the daemon turns pool metrics into usage samples, in seconds.
pub const USAGE_REPORT_SECS: u64 = 10;

/// Capacity of the scale decision broadcast channel.
/// Slow subscribers skip ahead rather than block the controller.
pub const DECISION_CHANNEL_CAPACITY: usize = 64;

// === Mail transports ===

/// Port on which SMTP speaks TLS from the first byte (RFC 8314).
pub const SMTPS_PORT: u16 = 465;

/// TCP connect and command timeout for mail sessions in seconds.
pub const MAIL_CONNECT_TIMEOUT_SECS: u64 = 30;
