use async_trait::async_trait;

use super::ConnectionKind;

/// Opens, probes and closes connections of one kind.
///
/// The pool owns every connection it gets from `create` and hands it back to
/// `close` exactly once, even when the connection is already broken.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn kind(&self) -> ConnectionKind;

    /// Open and authenticate a new session.
    async fn create(&self) -> anyhow::Result<Self::Connection>;

    /// Cheap liveness probe. Any failure inside the probe means "not alive".
    async fn validate(&self, conn: &mut Self::Connection) -> bool;

    /// Shut the session down. The pool logs and ignores errors.
    async fn close(&self, conn: Self::Connection) -> anyhow::Result<()>;
}
