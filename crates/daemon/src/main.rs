// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! AFk session supervisor daemon (afkd)
//!
//! Background process that owns every long-running worker invocation and
//! the cron schedule engine. Listens on a Unix socket for commands from
//! the `afk` CLI; should not be invoked directly outside of that.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::io::Write;
use std::time::Duration;

use afk_daemon::{ListenCtx, Listener, LifecycleError};
use afk_daemon::supervisor::{Config, Supervisor};
use fs2::FileExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info};

const VERSION_LINE: &str = concat!("afkd ", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("{VERSION_LINE}");
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("{VERSION_LINE}");
                println!("AFk session supervisor daemon");
                println!();
                println!("USAGE:");
                println!("    afkd");
                println!();
                println!("The daemon is typically started by the `afk` CLI and should not");
                println!("be invoked directly. It listens on a Unix socket for commands.");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: afkd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let config = Config::load()?;

    rotate_log_if_needed(&config.log_path);
    write_startup_marker(&config)?;
    let log_guard = setup_logging(&config)?;

    info!("starting afk daemon");

    let lock_file = match acquire_lock(&config) {
        Ok(f) => f,
        Err(LifecycleError::LockFailed(_)) => {
            let pid = std::fs::read_to_string(&config.lock_path).unwrap_or_default().trim().to_string();
            eprintln!("afkd is already running");
            if !pid.is_empty() {
                eprintln!("  pid: {pid}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            write_startup_error(&config, &e);
            error!(error = %e, "failed to acquire daemon lock");
            drop(log_guard);
            return Err(e.into());
        }
    };

    let supervisor = match Supervisor::start(config.clone()) {
        Ok(s) => s,
        Err(e) => {
            write_startup_error(&config, &e);
            error!(error = %e, "failed to start supervisor");
            drop(log_guard);
            return Err(e.into());
        }
    };
    std::fs::write(&config.version_path, env!("CARGO_PKG_VERSION"))?;

    // Bind the socket last, once everything else that could fail has
    // already succeeded.
    let _ = std::fs::remove_file(&config.socket_path);
    let unix_listener = tokio::net::UnixListener::bind(&config.socket_path)
        .map_err(|e| LifecycleError::BindFailed(config.socket_path.clone(), e))?;

    let shutdown_notify = std::sync::Arc::new(Notify::new());
    let supervisor = std::sync::Arc::new(supervisor);

    let ctx = std::sync::Arc::new(ListenCtx {
        supervisor: std::sync::Arc::clone(&supervisor),
        start_time: std::time::Instant::now(),
        shutdown: std::sync::Arc::clone(&shutdown_notify),
    });
    let listener = Listener::new(unix_listener, ctx);
    tokio::spawn(listener.run());

    spawn_maintenance(std::sync::Arc::clone(&supervisor));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!(socket = %config.socket_path.display(), "daemon ready");
    println!("READY");

    tokio::select! {
        _ = shutdown_notify.notified() => info!("shutdown requested via command"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    supervisor.shutdown();
    drop(lock_file);
    let _ = std::fs::remove_file(&config.socket_path);
    info!("daemon stopped");
    Ok(())
}

/// Periodic retention sweep (§4.G). Runs every `CLEANUP_INTERVAL`; a
/// failed sweep is logged and retried on the next tick rather than
/// aborting the daemon.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

fn spawn_maintenance(supervisor: std::sync::Arc<Supervisor>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let summary = supervisor.cleanup.sweep(false);
            info!(deleted = summary.deleted, scanned = summary.scanned, "retention sweep complete");
        }
    });
}

/// Opens (without truncating, so a concurrent reader can still see the
/// previous PID) and exclusively locks the daemon's lock file, then
/// stamps it with this process's PID. Held for the process lifetime;
/// dropping the returned file releases the lock.
fn acquire_lock(config: &Config) -> Result<std::fs::File, LifecycleError> {
    if let Some(parent) = config.lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().write(true).create(true).truncate(false).open(&config.lock_path)?;
    file.try_lock_exclusive().map_err(LifecycleError::LockFailed)?;
    file.set_len(0)?;
    let mut f = &file;
    writeln!(f, "{}", std::process::id())?;
    Ok(file)
}

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep (daemon.log.1, .2, .3).
const MAX_ROTATED_LOGS: u32 = 3;

/// Rotates `daemon.log` -> `.1` -> `.2` -> `.3`, dropping the oldest.
/// Best-effort: failures are silently ignored so the daemon still
/// starts.
fn rotate_log_if_needed(log_path: &std::path::Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size < MAX_LOG_SIZE {
        return;
    }

    let log_str = log_path.display().to_string();
    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }
    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

const STARTUP_MARKER_PREFIX: &str = "--- afkd: starting (pid: ";

fn write_startup_marker(config: &Config) -> Result<(), LifecycleError> {
    if let Some(parent) = config.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&config.log_path)?;
    writeln!(file, "{}{}) ---\n", STARTUP_MARKER_PREFIX, std::process::id())?;
    Ok(())
}

fn write_startup_error(config: &Config, error: &LifecycleError) {
    let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&config.log_path) else {
        return;
    };
    let _ = writeln!(file, "ERROR failed to start daemon: {error}");
}

fn setup_logging(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    if let Some(parent) = config.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender =
        tracing_appender::rolling::never(config.log_path.parent().ok_or(LifecycleError::NoStateDir)?, config.log_path.file_name().ok_or(LifecycleError::NoStateDir)?);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = if afk_daemon::env::debug_enabled() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry().with(filter).with(fmt::layer().with_writer(non_blocking)).init();

    Ok(guard)
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
