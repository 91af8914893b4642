use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::config::{AccountConfig, ImapConfig};
use crate::constants::MAIL_CONNECT_TIMEOUT_SECS;
use crate::pool::{ConnectionFactory, ConnectionKind};

pub type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// Opens logged-in IMAP sessions for one account.
pub struct ImapFactory {
    config: ImapConfig,
    username: String,
    password: String,
    connector: TlsConnector,
    timeout: Duration,
}

impl ImapFactory {
    pub fn new(account: &AccountConfig, password: String, connector: TlsConnector) -> Self {
        Self {
            config: account.imap.clone(),
            username: account.username().to_string(),
            password,
            connector,
            timeout: Duration::from_secs(MAIL_CONNECT_TIMEOUT_SECS),
        }
    }

    async fn connect(&self) -> Result<ImapSession> {
        let addr = format!("{}:{}", self.config.server, self.config.port);

        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("Timed out connecting to {}", addr))?
            .with_context(|| format!("Failed to connect to {}", addr))?;

        let server_name = ServerName::try_from(self.config.server.clone())
            .with_context(|| format!("Invalid IMAP server name '{}'", self.config.server))?;
        let tls_stream = tokio::time::timeout(self.timeout, self.connector.connect(server_name, tcp))
            .await
            .with_context(|| format!("TLS handshake with {} timed out", self.config.server))?
            .context("TLS handshake failed")?;

        // Wrap tokio stream with compat layer for futures-io compatibility
        let client = async_imap::Client::new(tls_stream.compat());

        let session = client
            .login(&self.username, &self.password)
            .await
            .map_err(|e| anyhow::anyhow!("Login failed: {:?}", e.0))?;

        tracing::info!("Connected to IMAP server {}", self.config.server);
        Ok(session)
    }
}

#[async_trait]
impl ConnectionFactory for ImapFactory {
    type Connection = ImapSession;

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::MessageStore
    }

    async fn create(&self) -> Result<ImapSession> {
        self.connect().await
    }

    async fn validate(&self, session: &mut ImapSession) -> bool {
        match tokio::time::timeout(self.timeout, session.noop()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("IMAP NOOP failed: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!("IMAP NOOP timed out");
                false
            }
        }
    }

    async fn close(&self, mut session: ImapSession) -> Result<()> {
        tokio::time::timeout(self.timeout, session.logout())
            .await
            .context("IMAP logout timed out")?
            .context("IMAP logout failed")?;
        Ok(())
    }
}
