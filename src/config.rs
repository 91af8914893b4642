use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{SIZING_TICK_SECS, USAGE_REPORT_SECS};
use crate::pool::ConnectionKind;
use crate::sizing::DynamicPoolConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Mail accounts whose servers get pooled
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Which account to use by default (index into accounts)
    #[serde(default)]
    pub default_account: Option<usize>,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    /// Login name, if it differs from the address
    #[serde(default)]
    pub username: Option<String>,
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
}

impl AccountConfig {
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Refuse to authenticate over a session that could not be upgraded to TLS
    #[serde(default = "default_true")]
    pub tls: bool,
}

/// Per-kind overrides applied over the recommended pool seeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolsConfig {
    #[serde(default)]
    pub imap: PoolOverrides,
    #[serde(default)]
    pub smtp: PoolOverrides,
}

/// Every field is optional; durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOverrides {
    pub min_connections: Option<usize>,
    pub max_connections: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub verification_interval_ms: Option<u64>,
    pub max_verification_failures: Option<u32>,
    pub adaptive_scaling: Option<bool>,
    pub min_effective_connections: Option<usize>,
    pub max_effective_connections: Option<usize>,
    pub scale_down_delay_ms: Option<u64>,
}

impl PoolOverrides {
    pub fn apply(&self, mut config: DynamicPoolConfig) -> DynamicPoolConfig {
        let ms = Duration::from_millis;
        let pool = &mut config.pool;
        if let Some(v) = self.min_connections {
            pool.min_connections = v;
        }
        if let Some(v) = self.max_connections {
            pool.max_connections = v;
        }
        if let Some(v) = self.acquire_timeout_ms {
            pool.acquire_timeout = ms(v);
        }
        if let Some(v) = self.idle_timeout_ms {
            pool.idle_timeout = ms(v);
        }
        if let Some(v) = self.max_retries {
            pool.max_retries = v;
        }
        if let Some(v) = self.retry_delay_ms {
            pool.retry_delay = ms(v);
        }
        if let Some(v) = self.health_check_interval_ms {
            pool.health_check_interval = ms(v);
        }
        if let Some(ref mut verification) = config.verification {
            if let Some(v) = self.verification_interval_ms {
                verification.verification_interval = ms(v);
            }
            if let Some(v) = self.max_verification_failures {
                verification.max_verification_failures = v;
            }
        }
        if let Some(v) = self.adaptive_scaling {
            config.adaptive_scaling = v;
        }
        if let Some(v) = self.min_effective_connections {
            config.min_effective_connections = v;
        }
        if let Some(v) = self.max_effective_connections {
            config.max_effective_connections = v;
        }
        if let Some(v) = self.scale_down_delay_ms {
            config.scale_down_delay = ms(v);
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Run the adaptive sizing controller
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// How often pool metrics are turned into usage samples
    #[serde(default = "default_report_secs")]
    pub report_secs: u64,
}

impl SizingConfig {
    /// Both periods drive tokio intervals, which reject zero.
    pub fn validate(&self) -> Result<()> {
        if self.tick_secs == 0 {
            anyhow::bail!("[sizing] tick_secs must be non-zero");
        }
        if self.report_secs == 0 {
            anyhow::bail!("[sizing] report_secs must be non-zero");
        }
        Ok(())
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: default_tick_secs(),
            report_secs: default_report_secs(),
        }
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_tick_secs() -> u64 {
    SIZING_TICK_SECS
}

fn default_report_secs() -> u64 {
    USAGE_REPORT_SECS
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("mailpool");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get the default account (first account or the one specified by default_account)
    pub fn default_account(&self) -> Option<&AccountConfig> {
        if let Some(idx) = self.default_account {
            self.accounts.get(idx)
        } else {
            self.accounts.first()
        }
    }

    /// Recommended seed for `kind` with this file's overrides applied.
    pub fn pool_config(&self, kind: ConnectionKind) -> DynamicPoolConfig {
        let seed = DynamicPoolConfig::recommended(kind);
        match kind {
            ConnectionKind::MessageStore => self.pools.imap.apply(seed),
            ConnectionKind::MailTransfer => self.pools.smtp.apply(seed),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [[accounts]]\n\
                 email = \"you@example.com\"\n\n\
                 [accounts.imap]\n\
                 server = \"imap.example.com\"\n\n\
                 [accounts.smtp]\n\
                 server = \"smtp.example.com\"\n\n\
                 [pools.imap]\n\
                 max_connections = 4",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        for kind in [ConnectionKind::MessageStore, ConnectionKind::MailTransfer] {
            let pool = config.pool_config(kind);
            pool.validate()
                .with_context(|| format!("Invalid [pools.{}] settings", kind))?;
            if let Some(ref verification) = pool.verification {
                verification
                    .validate()
                    .with_context(|| format!("Invalid [pools.{}] settings", kind))?;
            }
        }
        config.sizing.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accounts_and_overrides() {
        let toml = r#"
            default_account = 1

            [[accounts]]
            email = "test@example.com"

            [accounts.imap]
            server = "imap.example.com"

            [accounts.smtp]
            server = "smtp.example.com"

            [[accounts]]
            email = "work@example.com"
            username = "jdoe"

            [accounts.imap]
            server = "imap.work.com"
            port = 1993

            [accounts.smtp]
            server = "smtp.work.com"
            port = 465

            [pools.imap]
            max_connections = 5
            idle_timeout_ms = 120000

            [pools.smtp]
            max_verification_failures = 5

            [sizing]
            tick_secs = 15
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].imap.port, 993);
        assert_eq!(config.accounts[0].smtp.port, 587);
        assert!(config.accounts[0].smtp.tls);
        assert_eq!(config.accounts[0].username(), "test@example.com");

        let account = config.default_account().unwrap();
        assert_eq!(account.email, "work@example.com");
        assert_eq!(account.username(), "jdoe");
        assert_eq!(account.imap.port, 1993);

        let imap = config.pool_config(ConnectionKind::MessageStore);
        assert_eq!(imap.pool.max_connections, 5);
        assert_eq!(imap.pool.idle_timeout, Duration::from_secs(120));
        assert_eq!(imap.pool.acquire_timeout, Duration::from_secs(3));

        let smtp = config.pool_config(ConnectionKind::MailTransfer);
        assert_eq!(smtp.verification.unwrap().max_verification_failures, 5);

        assert!(config.sizing.enabled);
        assert_eq!(config.sizing.tick_secs, 15);
        assert_eq!(config.sizing.report_secs, USAGE_REPORT_SECS);
    }

    #[test]
    fn test_empty_file_uses_seeds() {
        let config = Config::parse("").unwrap();
        assert!(config.default_account().is_none());
        assert_eq!(
            config.pool_config(ConnectionKind::MailTransfer),
            DynamicPoolConfig::recommended(ConnectionKind::MailTransfer)
        );
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let toml = r#"
            [pools.smtp]
            min_connections = 4
            max_connections = 2
        "#;
        let err = Config::parse(toml).unwrap_err();
        assert!(format!("{:#}", err).contains("[pools.smtp]"));

        let toml = r#"
            [pools.smtp]
            max_verification_failures = 0
        "#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_max_outside_effective_range_rejected() {
        let toml = r#"
            [pools.imap]
            max_connections = 10
        "#;
        let err = Config::parse(toml).unwrap_err();
        assert!(format!("{:#}", err).contains("[pools.imap]"));

        // Raising the ceiling alongside makes it valid
        let toml = r#"
            [pools.imap]
            max_connections = 10
            max_effective_connections = 12
        "#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(
            config.pool_config(ConnectionKind::MessageStore).pool.max_connections,
            10
        );
    }

    #[test]
    fn test_zero_sizing_periods_rejected() {
        let err = Config::parse("[sizing]\ntick_secs = 0").unwrap_err();
        assert!(err.to_string().contains("tick_secs"));

        let err = Config::parse("[sizing]\nreport_secs = 0").unwrap_err();
        assert!(err.to_string().contains("report_secs"));

        assert!(Config::parse("[sizing]\nenabled = false\ntick_secs = 5").is_ok());
    }

    #[test]
    fn test_verification_overrides_ignored_without_overlay() {
        let overrides = PoolOverrides {
            verification_interval_ms: Some(1000),
            ..PoolOverrides::default()
        };
        let imap = overrides.apply(DynamicPoolConfig::recommended(ConnectionKind::MessageStore));
        assert!(imap.verification.is_none());
    }
}
