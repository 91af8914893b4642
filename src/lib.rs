//! Connection pooling for IMAP and SMTP sessions, with a re-validation
//! overlay for transports that go stale and an adaptive sizing controller.

pub mod config;
pub mod constants;
pub mod credentials;
pub mod mail;
pub mod pool;
pub mod sizing;

pub use pool::{
    ConnectionFactory, ConnectionKind, ConnectionPool, PoolConfig, PoolError, PoolMetrics,
    PooledConnection, VerificationConfig,
};
pub use sizing::{DynamicPoolConfig, ScaleDecision, SizingController, UsageSample};
