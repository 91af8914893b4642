//! Connection factories for the two mail protocols.
//!
//! - `imap.rs` - Logged-in IMAP sessions over implicit TLS
//! - `smtp.rs` - Authenticated SMTP sessions plus message building

pub mod imap;
pub mod smtp;

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

pub use imap::{ImapFactory, ImapSession};
pub use smtp::{OutgoingMessage, SmtpFactory};

/// TLS client trusting Mozilla's bundled root certificates.
pub fn tls_connector() -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("TLS provider supports no protocol versions")?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Domain part of an address, used as the SMTP hello name.
pub(crate) fn address_domain(email: &str) -> Option<&str> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim())
        .filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_connector_builds() {
        assert!(tls_connector().is_ok());
    }

    #[test]
    fn test_address_domain() {
        assert_eq!(address_domain("me@example.com"), Some("example.com"));
        assert_eq!(address_domain("\"a@b\"@mail.example.org"), Some("mail.example.org"));
        assert_eq!(address_domain("nobody"), None);
        assert_eq!(address_domain("trailing@"), None);
    }
}
