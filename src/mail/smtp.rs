use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;

use crate::config::{AccountConfig, SmtpConfig};
use crate::constants::{MAIL_CONNECT_TIMEOUT_SECS, SMTPS_PORT};
use crate::pool::{ConnectionFactory, ConnectionKind, PooledConnection};

use super::address_domain;

/// Opens authenticated SMTP sessions for one account.
///
/// Port 465 speaks TLS from the start; any other port is upgraded with
/// STARTTLS when the server offers it.
pub struct SmtpFactory {
    config: SmtpConfig,
    credentials: Credentials,
    hello_name: ClientId,
    timeout: Duration,
}

impl SmtpFactory {
    pub fn new(account: &AccountConfig, password: String) -> Self {
        let hello_name = address_domain(&account.email).unwrap_or("localhost");
        Self {
            config: account.smtp.clone(),
            credentials: Credentials::new(account.username().to_string(), password),
            hello_name: ClientId::Domain(hello_name.to_string()),
            timeout: Duration::from_secs(MAIL_CONNECT_TIMEOUT_SECS),
        }
    }

    async fn connect(&self) -> Result<AsyncSmtpConnection> {
        let server = self.config.server.as_str();
        let implicit_tls = if self.config.port == SMTPS_PORT {
            Some(TlsParameters::new(server.to_string()).context("Invalid SMTP TLS parameters")?)
        } else {
            None
        };

        let mut conn = AsyncSmtpConnection::connect_tokio1(
            (server, self.config.port),
            Some(self.timeout),
            &self.hello_name,
            implicit_tls,
            None,
        )
        .await
        .with_context(|| format!("Failed to connect to {}:{}", server, self.config.port))?;

        if !conn.is_encrypted() {
            if conn.can_starttls() {
                let params =
                    TlsParameters::new(server.to_string()).context("Invalid SMTP TLS parameters")?;
                conn.starttls(params, &self.hello_name)
                    .await
                    .context("STARTTLS failed")?;
            } else if self.config.tls {
                // Credentials must never cross the wire in plaintext
                anyhow::bail!("SMTP server {} does not offer STARTTLS", server);
            } else {
                tracing::warn!("SMTP session with {} is not encrypted", server);
            }
        }

        conn.auth(&[Mechanism::Plain, Mechanism::Login], &self.credentials)
            .await
            .context("SMTP authentication failed")?;

        tracing::info!("Connected to SMTP server {}", server);
        Ok(conn)
    }
}

#[async_trait]
impl ConnectionFactory for SmtpFactory {
    type Connection = AsyncSmtpConnection;

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::MailTransfer
    }

    async fn create(&self) -> Result<AsyncSmtpConnection> {
        self.connect().await
    }

    async fn validate(&self, conn: &mut AsyncSmtpConnection) -> bool {
        tokio::time::timeout(self.timeout, conn.test_connected())
            .await
            .unwrap_or(false)
    }

    async fn close(&self, mut conn: AsyncSmtpConnection) -> Result<()> {
        conn.quit().await.context("SMTP QUIT failed")?;
        Ok(())
    }
}

/// A plain-text message to hand to a pooled SMTP session.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub from_email: String,
    pub from_name: Option<String>,
    /// Comma-separated
    pub to: String,
    /// Comma-separated, may be empty
    pub cc: String,
    pub subject: String,
    pub body: String,
}

impl OutgoingMessage {
    pub fn build(&self) -> Result<Message> {
        let from_mailbox = if let Some(ref name) = self.from_name {
            format!("{} <{}>", name, self.from_email)
                .parse::<Mailbox>()
                .context("Invalid from address")?
        } else {
            self.from_email
                .parse::<Mailbox>()
                .context("Invalid from address")?
        };

        let mut builder = Message::builder().from(from_mailbox).subject(&self.subject);
        for to in parse_address_list(&self.to).context("Invalid recipient address")? {
            builder = builder.to(to);
        }
        for cc in parse_address_list(&self.cc).context("Invalid CC address")? {
            builder = builder.cc(cc);
        }

        builder
            .header(ContentType::TEXT_PLAIN)
            .body(self.body.clone())
            .context("Failed to build email message")
    }
}

/// Parse a comma-separated address list, skipping empty entries (trailing commas).
pub fn parse_address_list(list: &str) -> Result<Vec<Mailbox>> {
    list.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(|addr| {
            addr.parse::<Mailbox>()
                .with_context(|| format!("Could not parse address: {}", addr))
        })
        .collect()
}

/// Send `message` over a pooled session.
///
/// A transport-level failure marks the session unhealthy so the pool does
/// not hand it out again without checking it.
pub async fn deliver<F>(conn: &mut PooledConnection<F>, message: &Message) -> Result<()>
where
    F: ConnectionFactory<Connection = AsyncSmtpConnection>,
{
    let envelope = message.envelope();
    let result = conn.send(envelope, &message.formatted()).await;
    match result {
        Ok(response) => {
            tracing::info!(
                record = %conn.id(),
                code = %response.code(),
                "Email sent to {} recipient(s)",
                envelope.to().len()
            );
            Ok(())
        }
        Err(e) => {
            if e.is_transient() || e.is_permanent() {
                // The server answered; the session itself is fine.
                Err(e).context("SMTP server rejected the message")
            } else {
                conn.mark_unhealthy();
                Err(e).context("Failed to send email")
            }
        }
    }
}
