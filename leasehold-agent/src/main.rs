//! leasehold - run commands as cluster-wide singleton jobs

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, CellAlignment, Color,
    ContentArrangement, Table,
};
use leasehold_core::{
    FnCallback, HeldLock, LockConfig, LockManager, LockName, LockStore, LockToken,
    PostgresLockStore, RenewalScheduler, ShutdownSignal,
};
use tokio::process::Command;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when another node holds the lock (EX_TEMPFAIL).
const EXIT_CONTENDED: u8 = 75;

#[derive(Parser, Debug)]
#[command(name = "leasehold")]
#[command(about = "Cluster-wide lease locks backed by PostgreSQL", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the lock tables if they do not exist
    InitSchema,

    /// Run a command while holding a lock, renewing it until the command exits
    Run {
        /// Lock name as NAMESPACE:NAME
        #[arg(short, long)]
        name: String,

        /// Lease length in milliseconds (defaults to LEASEHOLD_DEFAULT_TTL_MS)
        #[arg(long)]
        ttl_ms: Option<u64>,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Show the locks currently held in a namespace
    Status {
        #[arg(short, long)]
        namespace: String,
    },

    /// Release a lock by token
    Release {
        /// Lock name as NAMESPACE:NAME
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = LockConfig::load().context("failed to load configuration")?;
    init_tracing(&config);

    let store = Arc::new(
        PostgresLockStore::connect()
            .await
            .context("failed to connect to the lock store")?,
    );

    match args.command {
        Commands::InitSchema => {
            store
                .ensure_schema()
                .await
                .context("failed to create lock tables")?;
            info!("lock tables ready");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            name,
            ttl_ms,
            command,
        } => {
            store
                .ensure_schema()
                .await
                .context("failed to create lock tables")?;
            let name = LockName::parse(&name)?;
            let ttl = ttl_ms.map_or_else(|| config.default_ttl(), Duration::from_millis);
            let manager = Arc::new(LockManager::new(store));
            run_singleton(&config, manager, name, ttl, &command).await
        }
        Commands::Status { namespace } => {
            let now = store.now_ms();
            let manager = LockManager::new(store);
            let held = manager
                .list_held(&namespace)
                .await
                .with_context(|| format!("failed to list locks in {namespace}"))?;
            print_held(&namespace, &held, now);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Release { name, token } => {
            let name = LockName::parse(&name)?;
            let manager = LockManager::new(store);
            let token = LockToken::from_string(token);
            if manager.release(&token, &name).await? {
                println!("released {name}");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{name} is not held by that token");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

enum ChildOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    LockLost,
    Shutdown,
}

async fn run_singleton(
    config: &LockConfig,
    manager: Arc<LockManager>,
    name: LockName,
    ttl: Duration,
    command: &[String],
) -> Result<ExitCode> {
    let (program, program_args) = command.split_first().context("no command given")?;

    let shutdown = ShutdownSignal::new();
    tokio::spawn(forward_signals(shutdown.clone()));
    let scheduler = RenewalScheduler::new(manager.clone(), shutdown.clone(), config);
    scheduler.check_ttl(ttl)?;

    let token = match manager
        .acquire_with_retry(
            &name,
            ttl,
            config.acquire_retry_wait(),
            config.acquire_retry_count,
        )
        .await
    {
        Ok(token) => token,
        Err(err) if err.is_contention() => {
            info!(lock = %name, "lock held by another instance, not running");
            return Ok(ExitCode::from(EXIT_CONTENDED));
        }
        Err(err) => return Err(err).with_context(|| format!("failed to acquire {name}")),
    };
    info!(lock = %name, token = %token, "running command under lock");

    let lost_name = name.clone();
    let callback = Arc::new(FnCallback::new(
        || true,
        move || warn!(lock = %lost_name, "lock lost, stopping command"),
    ));
    let handle = match scheduler.start_renewal(token.clone(), name.clone(), ttl, callback) {
        Ok(handle) => handle,
        Err(err) => {
            if let Err(release_err) = manager.release(&token, &name).await {
                warn!(lock = %name, error = %release_err, "failed to release lock");
            }
            return Err(err).with_context(|| format!("failed to renew {name}"));
        }
    };

    let mut child = match Command::new(program)
        .args(program_args)
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            if let Err(release_err) = handle.release().await {
                warn!(lock = %name, error = %release_err, "failed to release lock");
            }
            return Err(err).with_context(|| format!("failed to start {program}"));
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => ChildOutcome::Exited(status),
        _ = handle.lost() => ChildOutcome::LockLost,
        _ = shutdown.wait() => ChildOutcome::Shutdown,
    };
    if !matches!(outcome, ChildOutcome::Exited(_)) {
        if let Err(err) = child.kill().await {
            warn!(lock = %name, error = %err, "failed to kill command");
        }
    }

    match handle.release().await {
        Ok(true) => info!(lock = %name, "lock released"),
        Ok(false) => info!(lock = %name, "lock was already gone at release"),
        Err(err) => warn!(lock = %name, error = %err, "failed to release lock"),
    }

    match outcome {
        ChildOutcome::Exited(Ok(status)) if status.success() => Ok(ExitCode::SUCCESS),
        ChildOutcome::Exited(Ok(status)) => {
            error!(lock = %name, %status, "command failed");
            Ok(ExitCode::FAILURE)
        }
        ChildOutcome::Exited(Err(err)) => {
            Err(err).with_context(|| format!("failed waiting for {program}"))
        }
        ChildOutcome::LockLost => {
            error!(lock = %name, "command killed after losing the lock");
            Ok(ExitCode::FAILURE)
        }
        ChildOutcome::Shutdown => {
            info!(lock = %name, "command stopped for shutdown");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn forward_signals(shutdown: ShutdownSignal) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    shutdown.trigger();
}

fn print_held(namespace: &str, held: &[HeldLock], now_ms: i64) {
    if held.is_empty() {
        println!("no locks held in {namespace}");
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        ["lock", "acquired", "expires", "remaining"]
            .into_iter()
            .map(|title| {
                Cell::new(title)
                    .fg(Color::Cyan)
                    .set_alignment(CellAlignment::Center)
            }),
    );
    for lock in held {
        let remaining = Duration::from_millis((lock.expiry_time - now_ms).max(0) as u64);
        table.add_row(vec![
            Cell::new(format!("{namespace}:{}", lock.local_name)),
            Cell::new(format_millis(lock.start_time)),
            Cell::new(format_millis(lock.expiry_time)),
            Cell::new(format!("{:.1}s", remaining.as_secs_f64())).set_alignment(CellAlignment::Right),
        ]);
    }
    println!("{table}");
}

fn format_millis(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn init_tracing(config: &LockConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_takes_trailing_command() {
        let args = Args::try_parse_from([
            "leasehold", "run", "--name", "jobs:nightly", "--ttl-ms", "5000", "--", "sh", "-c",
            "exit 0",
        ])
        .unwrap();
        match args.command {
            Commands::Run {
                name,
                ttl_ms,
                command,
            } => {
                assert_eq!(name, "jobs:nightly");
                assert_eq!(ttl_ms, Some(5000));
                assert_eq!(command, vec!["sh", "-c", "exit 0"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Args::try_parse_from(["leasehold", "run", "--name", "jobs:nightly"]).is_err());
    }

    #[test]
    fn format_millis_renders_utc() {
        assert_eq!(format_millis(0), "1970-01-01 00:00:00.000 UTC");
        assert_eq!(format_millis(1_500), "1970-01-01 00:00:01.500 UTC");
    }
}
