// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! WolfBackup — Proxmox VE backup and restore for the Wolf Software Suite
//!
//! Drives vzdump on a Proxmox host over SSH and:
//! - Pulls finished archives down to a local directory
//! - Mirrors them to a WebDAV share (Nextcloud, Synology, Apache...)
//! - Applies keep-count retention on both tiers
//! - Restores archives back onto the host as containers or VMs
//! - Keeps a bounded history of every backup and restore

mod archive;
mod backup;
mod config;
mod coordinator;
mod engine;
mod error;
mod history;
mod notify;
mod remote;
mod restore;
mod retention;
mod retry;
mod schedule;
mod transfer;
mod webdav;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use config::{Config, DEFAULT_CONFIG_PATH};
use engine::{Engine, TaskKind, TaskOutcome};
use restore::RestoreSource;
use schedule::DailySchedule;

/// WolfBackup — Proxmox VE backup orchestration
#[derive(Parser)]
#[command(name = "wolfbackup", version, about = "Proxmox VE backup and restore for the Wolf software suite")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one backup now
    Backup,

    /// Restore an archive onto the Proxmox host
    Restore {
        /// Archive file name (or an absolute local path)
        file: String,

        /// Where to fetch the archive from
        #[arg(long = "from", value_enum, default_value_t = RestoreSource::Local)]
        from: RestoreSource,

        /// Restore under this guest id instead of the one in the file name
        #[arg(long)]
        target_id: Option<String>,

        /// Stop and destroy an existing guest with the target id first
        #[arg(long)]
        force: bool,

        /// Leave an existing guest alone and report the restore as skipped
        #[arg(long)]
        skip_existing: bool,

        /// Target storage (defaults to restore.storage)
        #[arg(long)]
        storage: Option<String>,
    },

    /// Show recent backups (or restores), newest first
    History {
        #[arg(long)]
        restores: bool,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// List archives available to restore, locally and on WebDAV
    List,

    /// Apply local and WebDAV retention without taking a backup
    Prune,

    /// Stay running and take the daily scheduled backup
    Daemon,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(log_filter()).init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let engine = match Engine::from_config(config) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Backup => report(engine.run_backup().await, |s| {
            for path in &s.archives {
                println!("{}", path.display());
            }
            for url in &s.uploaded {
                println!("  -> {}", url);
            }
        }),
        Command::Restore { file, from, target_id, force, skip_existing, storage } => {
            let mut request = engine.restore_request(&file, from);
            request.target_id = target_id;
            request.force |= force;
            request.skip_existing |= skip_existing;
            if let Some(storage) = storage {
                request.storage = storage;
            }
            report(engine.run_restore(request).await, |id| println!("Guest {}", id))
        }
        Command::History { restores, limit } => print_history(&engine, restores, limit),
        Command::List => print_archives(&engine).await,
        Command::Prune => report(engine.prune().await, |s| {
            println!("Removed {} local and {} WebDAV archives", s.local_deleted, s.webdav_deleted)
        }),
        Command::Daemon => run_daemon(engine).await,
    }
}

/// RUST_LOG directives, with this crate's own events at info
fn log_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("wolfbackup=info".parse().unwrap())
}

fn report<T>(outcome: TaskOutcome<T>, on_done: impl FnOnce(&T)) -> ExitCode {
    match outcome {
        TaskOutcome::Done(value) => {
            on_done(&value);
            ExitCode::SUCCESS
        }
        TaskOutcome::Skipped(value) => {
            on_done(&value);
            println!("Skipped: target already exists");
            ExitCode::SUCCESS
        }
        TaskOutcome::Dropped => {
            warn!("Another task is already running, nothing done");
            ExitCode::from(2)
        }
        TaskOutcome::Failed(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_history(engine: &Engine, restores: bool, limit: usize) -> ExitCode {
    let history = engine.history();
    let lines: Result<Vec<String>, _> = if restores {
        history.restores().map(|records| {
            records.into_iter().take(limit).map(|r| format!(
                "{}  {}  {:<6}  {}  {}",
                r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                if r.success { "OK  " } else { "FAIL" },
                r.target_id.unwrap_or_else(|| "-".to_string()),
                r.filename,
                r.message,
            )).collect()
        })
    } else {
        history.backups().map(|records| {
            records.into_iter().take(limit).map(|r| format!(
                "{}  {}  [{}]  {}",
                r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                if r.success { "OK  " } else { "FAIL" },
                r.guest_ids.join(","),
                r.message,
            )).collect()
        })
    };
    match lines {
        Ok(lines) if lines.is_empty() => {
            println!("No history yet");
            ExitCode::SUCCESS
        }
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to read history: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn print_archives(engine: &Engine) -> ExitCode {
    let listing = match engine.list_archives().await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to list archives: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let print = |label: &str, archives: &[archive::RemoteArchive]| {
        println!("{} ({})", label, archives.len());
        for a in archives {
            let size = a.size.map(|b| format!("{:.1} MiB", b as f64 / 1_048_576.0)).unwrap_or_default();
            println!("  {}  {:>12}  {}", a.timestamp.format("%Y-%m-%d %H:%M"), size, a.name);
        }
    };
    print("Local", &listing.local);
    if engine.config().webdav.is_enabled() {
        match &listing.webdav_error {
            Some(e) => println!("WebDAV: unavailable ({})", e),
            None => print("WebDAV", &listing.webdav),
        }
    }
    ExitCode::SUCCESS
}

async fn run_daemon(engine: Arc<Engine>) -> ExitCode {
    let Some(time) = engine.config().backup.schedule.clone() else {
        error!("daemon mode needs backup.schedule (HH:MM, UTC)");
        return ExitCode::FAILURE;
    };
    let mut schedule = DailySchedule::new(time.clone());

    info!("");
    info!("  🐺 WolfBackup v{}", env!("CARGO_PKG_VERSION"));
    info!("  ──────────────────────────────────");
    info!("  Host:       {}", engine.config().ssh.host);
    info!("  Schedule:   daily at {} UTC", time);
    info!("  Local dir:  {}", engine.config().backup.local_dir.display());
    if engine.config().webdav.is_enabled() {
        info!("  WebDAV:     {}", engine.config().webdav.url);
    }

    let mut tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if schedule.take_due(chrono::Utc::now()) {
                    info!("Running scheduled backup");
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if engine.run_backup().await.is_dropped() {
                            warn!("Scheduled backup skipped: backup is {:?}, restore is {:?}",
                                engine.phase(TaskKind::Backup), engine.phase(TaskKind::Restore));
                        }
                    });
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return ExitCode::SUCCESS;
            }
        }
    }
}
