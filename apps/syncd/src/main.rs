//! # tally-syncd
//!
//! Headless daemon that keeps a Tally POS local store in sync with the
//! remote store.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Initialize tracing (RUST_LOG, default info,tally=debug,sqlx=warn)  │
//! │  2. Load SyncConfig (TOML file → env overrides → validate)             │
//! │  3. Open the local store (runs embedded migrations)                    │
//! │  4. Build HttpRemote and the SyncCoordinator                           │
//! │  5. --once: one cycle, exit                                            │
//! │     otherwise: spawn the loop, signal online unless --offline,         │
//! │     run until Ctrl+C / SIGTERM, then shut down gracefully              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use directories::ProjectDirs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tally_db::{Database, DbConfig};
use tally_sync::{HttpRemote, SyncConfig, SyncCoordinator, SyncTrigger, TracingEmitter};

#[derive(Parser)]
#[command(name = "tally-syncd")]
#[command(about = "Sync a Tally POS local store with the remote store")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Local store file (defaults to TALLY_DB_PATH or the platform data directory)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Start without connectivity; no cycle runs
    #[arg(long)]
    offline: bool,

    /// Run a single sync cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let config = SyncConfig::load(cli.config)?;
    let db_path = match cli.db {
        Some(path) => path,
        None => default_database_path()?,
    };

    info!(
        device_id = %config.device_id(),
        db = %db_path.display(),
        remote = ?config.remote_url(),
        "Starting tally-syncd"
    );

    let db = Database::new(DbConfig::new(db_path)).await?;
    let remote = HttpRemote::from_config(&config)?;
    info!(endpoint = %remote.endpoint(), "Remote store configured");

    let coordinator = SyncCoordinator::builder()
        .with_settings(config.sync.clone())
        .with_database(db.clone())
        .with_remote(Arc::new(remote))
        .with_emitter(Arc::new(TracingEmitter))
        .build()?;

    if cli.once {
        if cli.offline {
            warn!("--once with --offline has nothing to do");
        } else {
            coordinator.set_online(true).await;
            let report = coordinator.run_cycle().await?;
            info!(
                pushed = report.push.pushed,
                failed = report.push.failed,
                pulled = report.pull.as_ref().map_or(0, |p| p.received),
                checkpoint = ?report.checkpoint,
                "Single cycle finished"
            );
        }
        db.close().await;
        return Ok(());
    }

    let handle = coordinator.spawn();
    if cli.offline {
        info!("Starting offline");
    } else {
        handle.trigger(SyncTrigger::Connectivity(true)).await?;
    }

    shutdown_signal().await;
    handle.shutdown().await?;
    db.close().await;

    info!("tally-syncd stopped");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tally_sync=trace` - Trace the sync crate only
/// - Default: `info,tally=debug,sqlx=warn`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Database file path.
///
/// ## Platform-Specific Paths
/// - **macOS**: `~/Library/Application Support/com.tally.pos/tally.db`
/// - **Windows**: `%APPDATA%\tally\pos\data\tally.db`
/// - **Linux**: `~/.local/share/pos/tally.db`
///
/// `TALLY_DB_PATH` overrides all of them.
fn default_database_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("TALLY_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    let dirs = ProjectDirs::from("com", "tally", "pos")
        .ok_or("Could not determine app data directory")?;
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    Ok(data_dir.join("tally.db"))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping sync");
}
