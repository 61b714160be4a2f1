//! sshmux
//!
//! Opens SSH logins inside tmux sessions, records every connection attempt
//! and keeps an eye on the health of the sessions it manages.

mod history_db;
mod hosts;
mod prompt;
mod secrets;
mod ssh;
mod tmux;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use sshmux_core::{
    AttemptFilter, AttemptStatus, AuthKind, ConnectionManager, LaunchOptions, ManagerConfig,
    MonitorConfig, ProbeConfig, Prompt, SecretKind, SecretManager, DEFAULT_RETENTION_DAYS,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::history_db::SqliteHistory;
use crate::hosts::Inventory;
use crate::prompt::TerminalPrompt;
use crate::secrets::FileCredentialStore;
use crate::ssh::Ssh2Client;
use crate::tmux::TmuxMultiplexer;

const DAY: u64 = 24 * 60 * 60;

/// sshmux - SSH sessions in tmux with connection history and health checks
#[derive(Parser, Debug)]
#[command(name = "sshmux")]
#[command(author = "sshmux Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Connect to SSH hosts inside tmux sessions", long_about = None)]
struct Args {
    /// Host inventory (JSON)
    #[arg(long, global = true)]
    hosts: Option<PathBuf>,

    /// History database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Credential store file
    #[arg(long, global = true)]
    secrets: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Seconds between health checks
    #[arg(long, default_value_t = 30, global = true)]
    monitor_interval: u64,

    /// Consecutive failed checks before a session is reported failed
    #[arg(long, default_value_t = 3, global = true)]
    failure_threshold: u32,

    /// History older than this many days is purged at start-up
    #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS, global = true)]
    retention_days: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a target (creates or reuses its session) and attach
    Connect {
        target: String,
        /// Do not attach after launching
        #[arg(long)]
        detach: bool,
    },
    /// Connect to every member of a group in one session
    Group {
        group: String,
        #[arg(long)]
        detach: bool,
    },
    /// Verify a target authenticates, with the long deadline
    Test { target: String },
    /// Attach to an existing session
    Attach { session: String },
    /// List live sessions with their current health
    Sessions,
    /// Monitor session health until interrupted
    Monitor,
    /// Show connection attempts, newest first
    History {
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        status: Option<AttemptStatus>,
        /// Only attempts from the last N days
        #[arg(long)]
        days: Option<u64>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Success rate and timings for a target or group
    Stats {
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },
    /// Recent health observations for one session
    Health {
        session: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete history older than N days
    Purge {
        #[arg(long)]
        older_than_days: u64,
    },
    /// Manage stored passwords and passphrases
    #[command(subcommand)]
    Secret(SecretCommand),
}

#[derive(Subcommand, Debug)]
enum SecretCommand {
    /// Store a secret for a target (read from the terminal)
    Set {
        target: String,
        /// Store a key passphrase instead of a password
        #[arg(long)]
        passphrase: bool,
    },
    /// Remove a stored secret
    Delete {
        target: String,
        #[arg(long)]
        passphrase: bool,
    },
    /// Report whether a secret is stored
    Has {
        target: String,
        #[arg(long)]
        passphrase: bool,
    },
    /// Move a target's password into the store and reference it from the inventory
    Migrate { target: String },
}

fn secret_kind(passphrase: bool) -> SecretKind {
    if passphrase {
        SecretKind::Passphrase
    } else {
        SecretKind::Password
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level)?;

    let paths = Paths::resolve(&args)?;

    match &args.command {
        Command::Secret(cmd) => run_secret(&paths, cmd).await,
        command => {
            let manager = build_manager(&args, &paths)?;

            // Retention
            let retention = Duration::from_secs(args.retention_days.saturating_mul(DAY));
            if let Err(e) = manager.purge_history(retention).await {
                warn!("History retention purge failed: {}", e);
            }

            run(&manager, &paths, command).await
        }
    }
}

async fn run(manager: &ConnectionManager, paths: &Paths, command: &Command) -> Result<()> {
    match command {
        Command::Connect { target, detach } => {
            let inventory = Inventory::load(&paths.hosts)?;
            let target = inventory.target(target)?;
            let outcome = manager
                .connect(&target)
                .await
                .with_context(|| format!("Failed to connect to {}", target.name))?;
            report_launch(&outcome.session_id, outcome.was_existing);
            if !detach {
                manager.attach(&outcome.session_id).await?;
            }
        }
        Command::Group { group, detach } => {
            let inventory = Inventory::load(&paths.hosts)?;
            let members = inventory.group(group)?;
            let outcome = manager
                .connect_group(group, &members)
                .await
                .with_context(|| format!("Failed to connect to group {}", group))?;
            report_launch(&outcome.session_id, outcome.was_existing);
            if !detach {
                manager.attach(&outcome.session_id).await?;
            }
        }
        Command::Test { target } => {
            let inventory = Inventory::load(&paths.hosts)?;
            let target = inventory.target(target)?;
            let method = manager
                .test_connection(&target)
                .await
                .with_context(|| format!("Connection test for {} failed", target.name))?;
            println!("{}: OK ({})", target.name, method);
        }
        Command::Attach { session } => {
            manager
                .attach(session)
                .await
                .with_context(|| format!("Failed to attach to {}", session))?;
        }
        Command::Sessions => list_sessions(manager).await?,
        Command::Monitor => run_monitor(manager).await?,
        Command::History {
            target,
            group,
            status,
            days,
            limit,
        } => {
            let filter = AttemptFilter {
                target: target.clone(),
                group: group.clone(),
                status: *status,
                since: days.map(|d| chrono::Utc::now() - chrono::Duration::days(d as i64)),
                limit: Some(*limit),
            };
            for a in manager.history(&filter).await? {
                println!(
                    "{:>6}  {}  {:<10} {:<16} {:<20} {:>8}ms  {}",
                    a.id,
                    a.start_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    a.status,
                    a.target_name,
                    format!("{}@{}", a.user, a.host),
                    a.duration.as_millis(),
                    a.error_message.as_deref().unwrap_or("")
                );
            }
        }
        Command::Stats { target, group } => {
            let stats = manager.stats(target.as_deref(), group.as_deref()).await?;
            println!("Attempts:      {}", stats.total);
            println!("Succeeded:     {}", stats.succeeded);
            println!("Success rate:  {:.1}%", stats.success_rate * 100.0);
            println!("Avg duration:  {}ms", stats.avg_duration.as_millis());
            if let (Some(first), Some(last)) = (stats.first, stats.last) {
                println!("First attempt: {}", first.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
                println!("Last attempt:  {}", last.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
            }
        }
        Command::Health { session, limit } => {
            for o in manager.health_history(session, *limit).await? {
                println!(
                    "{}  {:<9} {:>6}ms  {}",
                    o.check_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    o.status,
                    o.response_time.as_millis(),
                    o.error_message.as_deref().unwrap_or("")
                );
            }
        }
        Command::Purge { older_than_days } => {
            let removed = manager
                .purge_history(Duration::from_secs(older_than_days.saturating_mul(DAY)))
                .await?;
            println!("Removed {} history row(s)", removed);
        }
        Command::Secret(cmd) => run_secret(paths, cmd).await?,
    }

    Ok(())
}

/// Where the inventory, history and secrets live
struct Paths {
    hosts: PathBuf,
    db: PathBuf,
    secrets: PathBuf,
}

impl Paths {
    fn resolve(args: &Args) -> Result<Self> {
        let hosts = match &args.hosts {
            Some(path) => path.clone(),
            None => hosts::default_path().context("No config directory on this platform; pass --hosts")?,
        };
        let db = match &args.db {
            Some(path) => path.clone(),
            None => dirs::data_local_dir()
                .context("No local data directory on this platform; pass --db")?
                .join("sshmux")
                .join("history.db"),
        };
        let secrets = match &args.secrets {
            Some(path) => path.clone(),
            None => secrets::default_path().context("No local data directory on this platform; pass --secrets")?,
        };
        Ok(Self { hosts, db, secrets })
    }
}

fn build_manager(args: &Args, paths: &Paths) -> Result<ConnectionManager> {
    // Without a recorder there is no history to keep; refuse to run
    let history = SqliteHistory::open(&paths.db)
        .with_context(|| format!("Failed to open history database {}", paths.db.display()))?;

    let config = ManagerConfig {
        probe: ProbeConfig::default(),
        monitor: MonitorConfig {
            interval: Duration::from_secs(args.monitor_interval.max(1)),
            failure_threshold: args.failure_threshold.max(1),
        },
        launch: LaunchOptions::default(),
    };

    Ok(ConnectionManager::builder(
        Arc::new(Ssh2Client::new()),
        Arc::new(TmuxMultiplexer::new()),
        Arc::new(history),
    )
    .store(Arc::new(FileCredentialStore::at(&paths.secrets)))
    .prompt(Arc::new(TerminalPrompt::new()))
    .config(config)
    .build())
}

fn report_launch(session_id: &str, was_existing: bool) {
    if was_existing {
        println!("Reusing session {}", session_id);
    } else {
        println!("Created session {}", session_id);
    }
}

async fn list_sessions(manager: &ConnectionManager) -> Result<()> {
    let monitor = manager.monitor();
    monitor.discover().await.context("Failed to list sessions")?;
    monitor.tick().await.context("Health check failed")?;

    let records = monitor.get_active_sessions().await;
    if records.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    for record in records {
        println!(
            "{:<20} {:<9} since {}",
            record.session_id,
            record.last_status,
            record.start_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn run_monitor(manager: &ConnectionManager) -> Result<()> {
    let cancel = CancellationToken::new();
    let handle = manager.start_monitor(cancel.clone());
    info!(
        "Monitoring sessions every {:?} (Ctrl+C to stop)",
        manager.monitor().config().interval
    );

    shutdown_signal().await?;
    cancel.cancel();
    handle.await.context("Monitor task failed")?;

    let summary = manager.monitor().summary().await;
    info!(
        "Final status: {} healthy, {} degraded, {} failed, {} unknown",
        summary.healthy, summary.degraded, summary.failed, summary.unknown
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to setup SIGTERM handler")?;
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }
    Ok(())
}

async fn run_secret(paths: &Paths, cmd: &SecretCommand) -> Result<()> {
    let store = Arc::new(FileCredentialStore::at(&paths.secrets));
    let secrets = SecretManager::new(store.clone());
    let prompt = TerminalPrompt::new();

    match cmd {
        SecretCommand::Set { target, passphrase } => {
            let kind = secret_kind(*passphrase);
            let secret = prompt
                .prompt(&format!("{} for {}: ", kind.as_str(), target))
                .await
                .context("No secret entered")?;
            let id = secrets.store(target, kind, &secret).await?;
            println!("Stored {} as {} in {}", kind.as_str(), id, store.path().display());
        }
        SecretCommand::Delete { target, passphrase } => {
            secrets.delete(target, secret_kind(*passphrase)).await?;
            println!("Deleted");
        }
        SecretCommand::Has { target, passphrase } => {
            let present = secrets.has(target, secret_kind(*passphrase)).await?;
            println!("{}", if present { "yes" } else { "no" });
        }
        SecretCommand::Migrate { target } => {
            let mut inventory = Inventory::load(&paths.hosts)?;
            let entry = inventory.target_mut(target)?;
            if entry.auth_kind != AuthKind::Password {
                bail!("Target '{}' does not use password authentication", target);
            }
            if entry.is_store_backed() {
                bail!("Target '{}' already references a stored password", target);
            }

            let plaintext = prompt
                .prompt(&format!("Current password for {}: ", entry.destination()))
                .await
                .context("No password entered")?;
            let reference = secrets.migrate(target, &plaintext).await?;
            entry.credential_ref = Some(reference.clone());
            inventory.save(&paths.hosts)?;
            println!("{} now uses stored password {}", target, reference);
        }
    }
    Ok(())
}

/// Setup logging with tracing
fn setup_logging(level: &str) -> Result<()> {
    let log_level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
