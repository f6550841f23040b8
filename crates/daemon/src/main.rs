// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! orgsyncd - the per-device sync daemon.
//!
//! Keeps an organization's resources in sync with the other devices of the
//! organization through an `orgsync-relay`. State (SQLite store, device key,
//! log) lives in `~/.local/state/orgsync/` unless told otherwise.
//!
//! Usage:
//!   orgsyncd --org <id> [--relay ws://host:7890] [--state-dir <path>]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use orgsync_core::{Database, KeyIdentity, SyncOrchestrator, SystemClock, Transport};

mod config;
mod env;
mod error;
mod ws;

use config::{DaemonConfig, Overrides, CONFIG_NAME};
use error::{DaemonError, Result};
use ws::WsTransport;

/// PID filename within the state directory.
const PID_NAME: &str = "orgsyncd.pid";
/// Lock filename for single instance guarantee.
const LOCK_NAME: &str = "orgsyncd.lock";
const LOG_NAME: &str = "orgsyncd.log";

/// orgsyncd: offline-first organization sync daemon
#[derive(Parser, Debug)]
#[command(name = "orgsyncd", version)]
struct Args {
    /// State directory for the store, key, lock and log
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Config file (defaults to orgsync.toml in the state directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Organization to sync, overriding the config file
    #[arg(long)]
    org: Option<String>,

    /// Relay URL, overriding ORGSYNC_RELAY_URL and the config file
    #[arg(long)]
    relay: Option<String>,

    /// Log to stderr instead of the state directory
    #[arg(long)]
    stderr: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let state_dir = args.state_dir.clone().unwrap_or_else(env::default_state_dir);

    if let Err(e) = fs::create_dir_all(&state_dir) {
        eprintln!("orgsyncd: cannot create {}: {e}", state_dir.display());
        return ExitCode::FAILURE;
    }
    setup_logging(&state_dir.join(LOG_NAME), args.stderr);
    tracing::info!("orgsyncd starting, state_dir={}", state_dir.display());
    tracing::debug!(env = ?env::set_names(), "environment overrides");

    let lock_file = match acquire_lock(&state_dir) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("failed to acquire lock: {}", e);
            eprintln!("orgsyncd: {e}");
            return ExitCode::FAILURE;
        }
    };

    let pid_path = state_dir.join(PID_NAME);
    if let Err(e) = fs::write(&pid_path, format!("{}", std::process::id())) {
        tracing::error!("failed to write PID file: {}", e);
        return ExitCode::FAILURE;
    }

    let result = run(args, &state_dir).await;

    let _ = fs::remove_file(&pid_path);
    drop(lock_file);
    match result {
        Ok(()) => {
            tracing::info!("orgsyncd stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("orgsyncd failed: {}", e);
            eprintln!("orgsyncd: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, state_dir: &Path) -> Result<()> {
    let overrides = Overrides { org_id: args.org, relay_url: args.relay.or_else(env::relay_url) };
    let config_path = args.config.unwrap_or_else(|| state_dir.join(CONFIG_NAME));
    let config = DaemonConfig::load(&config_path, overrides)?;
    let org_id = config.org_id.clone();

    let db = Database::open(&config.database_path(state_dir))?.shared();
    let identity =
        KeyIdentity::load_or_generate(&config.identity_path(state_dir), config.display_name.as_deref())?;
    tracing::info!(org = %org_id, did = %identity.did(), relay = %config.relay_url, "device ready");

    let transport = Arc::new(WsTransport::new(config.relay_url.clone()));
    transport.join(&org_id);
    let shared: Arc<dyn Transport> = transport.clone();
    let orchestrator =
        SyncOrchestrator::new(db, shared, Arc::new(identity), Arc::new(SystemClock), config.sync.clone());

    let recovered = orchestrator.queue().recover_in_flight().await?;
    if recovered > 0 {
        tracing::info!(recovered, "requeued items interrupted by the last shutdown");
    }

    let connection = transport.spawn();
    let watcher = tokio::spawn(sync_on_connect(orchestrator.clone(), transport.subscribe_connected(), org_id.clone()));
    orchestrator.start(&org_id);

    // Signal readiness to a supervising process
    println!("READY");
    let _ = std::io::stdout().flush();

    shutdown_signal().await?;
    tracing::info!(
        connected = transport.is_connected(),
        connections = transport.connection_count(),
        "shutting down"
    );

    orchestrator.stop(&org_id);
    watcher.abort();
    orchestrator.scheduler().idle().await;
    connection.abort();
    Ok(())
}

/// Catches up whenever the relay connection comes up.
///
/// The first connection runs a full table sync; later ones sync
/// incrementally and flush whatever queued up while offline.
async fn sync_on_connect(orchestrator: SyncOrchestrator, mut connected: watch::Receiver<bool>, org_id: String) {
    let mut logged_in = false;
    loop {
        if connected.wait_for(|up| *up).await.is_err() {
            return;
        }

        let result = if logged_in {
            orchestrator.sync_incremental(&org_id).await
        } else {
            orchestrator.sync_after_login(&org_id).await
        };
        match result {
            Ok(stats) => {
                logged_in = true;
                tracing::info!(
                    org = %org_id,
                    success = stats.success,
                    failed = stats.failed,
                    skipped = stats.skipped,
                    conflicts = stats.conflicts,
                    "synced after connect"
                );
            }
            Err(e) => tracing::warn!(org = %org_id, error = %e, "sync after connect failed"),
        }
        if let Err(e) = orchestrator.drain(&org_id).await {
            tracing::warn!(org = %org_id, error = %e, "drain after connect failed");
        }

        if connected.wait_for(|up| !*up).await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

fn setup_logging(log_path: &Path, stderr: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(env::names::RUST_LOG).unwrap_or_else(|_| EnvFilter::new("info"));

    // Try to open log file, fall back to stderr
    let file = if stderr { None } else { fs::OpenOptions::new().create(true).append(true).open(log_path).ok() };
    if let Some(file) = file {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn acquire_lock(state_dir: &Path) -> Result<fs::File> {
    use fs2::FileExt;

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(state_dir.join(LOCK_NAME))?;
    file.try_lock_exclusive()
        .map_err(|_| DaemonError::AlreadyRunning(state_dir.display().to_string()))?;
    Ok(file)
}
