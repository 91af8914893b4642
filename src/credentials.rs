use anyhow::Result;
use std::env;

const ENV_PASSWORD: &str = "MAILPOOL_PASSWORD";
const KEYRING_SERVICE: &str = "mailpool";

/// Looks up the password a pool factory logs in with.
pub struct CredentialStore {
    email: String,
}

impl CredentialStore {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
        }
    }

    /// Check for password in environment variable first
    fn env_password() -> Option<String> {
        env::var(ENV_PASSWORD).ok().filter(|s| !s.is_empty())
    }

    fn keyring_key(protocol: &str, email: &str) -> String {
        format!("{}:{}", protocol, email)
    }

    fn keyring_get(&self, key: &str) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key).ok()?;
        entry.get_password().ok()
    }

    fn password_for(&self, protocol: &str) -> Result<String> {
        // 1. Try environment variable
        if let Some(pwd) = Self::env_password() {
            return Ok(pwd);
        }

        // 2. Try keyring
        if let Some(pwd) = self.keyring_get(&Self::keyring_key(protocol, &self.email)) {
            return Ok(pwd);
        }

        anyhow::bail!(
            "Password for {} not found. Set {} or store it in the system keyring \
             (service \"{}\", account \"{}\").",
            self.email,
            ENV_PASSWORD,
            KEYRING_SERVICE,
            Self::keyring_key(protocol, &self.email)
        )
    }

    pub fn get_imap_password(&self) -> Result<String> {
        self.password_for("imap")
    }

    pub fn get_smtp_password(&self) -> Result<String> {
        self.password_for("smtp")
    }
}
