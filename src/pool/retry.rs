//! Fixed-delay retry for connection creation.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use super::PoolConfig;

/// A creation run that never produced a connection.
#[derive(Debug)]
pub(crate) struct CreationExhausted {
    /// Attempts actually made
    pub attempts: u32,
    /// Error from the last attempt
    pub source: anyhow::Error,
    /// The pool shut down while waiting to retry
    pub aborted: bool,
}

/// Run `create` up to `1 + max_retries` times, `retry_delay` apart.
///
/// Stops early when `shutdown` fires during a delay.
pub(crate) async fn create_with_retry<T, F, Fut>(
    pool: &str,
    config: &PoolConfig,
    shutdown: &CancellationToken,
    mut create: F,
) -> Result<T, CreationExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match create().await {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!(pool = %pool, attempt, "Connection opened after retrying");
                }
                return Ok(conn);
            }
            Err(e) => e,
        };

        if attempt >= max_attempts {
            tracing::warn!(pool = %pool, attempts = attempt, "Giving up on new connection: {:#}", err);
            return Err(CreationExhausted {
                attempts: attempt,
                source: err,
                aborted: false,
            });
        }

        tracing::warn!(
            pool = %pool,
            attempt,
            max_attempts,
            "Connection attempt failed: {:#}. Retrying in {:?}",
            err,
            config.retry_delay
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(CreationExhausted {
                    attempts: attempt,
                    source: err,
                    aborted: true,
                });
            }
            _ = tokio::time::sleep(config.retry_delay) => {}
        }
    }
}
