use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mailpool::config::{AccountConfig, Config};
use mailpool::credentials::CredentialStore;
use mailpool::mail::{self, ImapFactory, SmtpFactory};
use mailpool::sizing::spawn_usage_reporter;
use mailpool::{ConnectionFactory, ConnectionKind, ConnectionPool, SizingController};

fn setup_logging() {
    use std::fs::{self, OpenOptions};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailpool=debug"));

    // Try to create a log file in the config directory
    let log_file = Config::config_dir()
        .ok()
        .and_then(|dir| fs::create_dir_all(&dir).ok().map(|_| dir.join("mailpool.log")))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        // Log to file
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // Fallback to stderr if file logging fails
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"mailpool - Pooled IMAP and SMTP sessions with adaptive sizing

Usage: mailpool [command]

Commands:
    run         Keep both pools running until Ctrl-C (default)
    check       Open, verify and release one session of each kind
    help        Show this help message

Configuration file: ~/.config/mailpool/config.toml
Password: MAILPOOL_PASSWORD or the system keyring (service "mailpool")
"#
    );
}

struct Pools {
    imap: ConnectionPool<ImapFactory>,
    smtp: ConnectionPool<SmtpFactory>,
}

fn build_pools(config: &Config, account: &AccountConfig) -> Result<Pools> {
    let creds = CredentialStore::new(&account.email);
    let connector = mail::tls_connector()?;

    let imap_factory = ImapFactory::new(account, creds.get_imap_password()?, connector);
    let smtp_factory = SmtpFactory::new(account, creds.get_smtp_password()?);

    let imap = config
        .pool_config(ConnectionKind::MessageStore)
        .build_pool("imap", imap_factory)?;
    let smtp = config
        .pool_config(ConnectionKind::MailTransfer)
        .build_pool("smtp", smtp_factory)?;
    Ok(Pools { imap, smtp })
}

/// Warm `pool` and, if sizing is enabled, hook it up to the controller.
async fn start_pool<F: ConnectionFactory>(
    config: &Config,
    kind: ConnectionKind,
    pool: &ConnectionPool<F>,
    controller: &Arc<SizingController>,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    if let Err(e) = pool.warm_up().await {
        tracing::warn!(pool = %pool.name(), "Warm-up failed: {}", e);
    }

    if !config.sizing.enabled {
        return Vec::new();
    }
    controller.register_pool(pool.name(), config.pool_config(kind));
    vec![
        controller.attach(pool.name(), pool.clone()),
        spawn_usage_reporter(
            Arc::clone(controller),
            pool.name(),
            pool.clone(),
            Duration::from_secs(config.sizing.report_secs),
            shutdown.clone(),
        ),
    ]
}

async fn run(config: Config) -> Result<()> {
    let account = config.default_account().ok_or_else(|| {
        anyhow::anyhow!(
            "No accounts configured. Add an [[accounts]] entry to {}",
            Config::config_path().map(|p| p.display().to_string()).unwrap_or_default()
        )
    })?;
    let pools = build_pools(&config, account)?;

    let controller = SizingController::global();
    let shutdown = CancellationToken::new();

    let mut tasks = Vec::new();
    tasks.extend(
        start_pool(
            &config,
            ConnectionKind::MessageStore,
            &pools.imap,
            &controller,
            &shutdown,
        )
        .await,
    );
    tasks.extend(
        start_pool(
            &config,
            ConnectionKind::MailTransfer,
            &pools.smtp,
            &controller,
            &shutdown,
        )
        .await,
    );
    if config.sizing.enabled {
        tasks.push(Arc::clone(&controller).spawn(
            Duration::from_secs(config.sizing.tick_secs),
            shutdown.clone(),
        ));
    }

    tracing::info!(account = %account.email, "Pools running");
    println!("Pools running for {}. Press Ctrl-C to stop.", account.email);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    shutdown.cancel();
    pools.imap.destroy().await;
    pools.smtp.destroy().await;
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("Background task failed: {}", e);
        }
    }

    println!("imap: {}", pools.imap.metrics());
    println!("smtp: {}", pools.smtp.metrics());
    Ok(())
}

async fn check_pool<F: ConnectionFactory>(pool: &ConnectionPool<F>) -> Result<()> {
    let mut conn = pool
        .acquire()
        .await
        .with_context(|| format!("Could not open a {} session", pool.factory().kind()))?;
    let alive = pool.validate_connection(&mut conn).await;
    println!(
        "{}: session {} opened, liveness check {}",
        pool.name(),
        conn.id(),
        if alive { "passed" } else { "FAILED" }
    );
    pool.release(conn).await?;

    let report = pool.verify_all_connections().await;
    println!(
        "{}: verified {} idle session(s), {} failed",
        pool.name(),
        report.verified,
        report.failed
    );
    println!("{}: {}", pool.name(), pool.metrics());
    pool.destroy().await;
    Ok(())
}

async fn run_check(config: Config) -> Result<()> {
    let account = config
        .default_account()
        .context("No accounts configured")?;
    let pools = build_pools(&config, account)?;

    let imap = check_pool(&pools.imap).await;
    let smtp = check_pool(&pools.smtp).await;
    imap?;
    smtp
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("check") => {
            setup_logging();
            run_check(Config::load()?).await
        }
        Some("run") | None => {
            setup_logging();
            run(Config::load()?).await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
