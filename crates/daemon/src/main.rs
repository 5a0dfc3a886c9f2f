// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! driftd worker daemon.
//!
//! Connects to the shared KV, rebuilds the running-scan index, and runs the
//! worker pool plus the background recovery and metrics tasks until
//! SIGTERM/SIGINT. Any number of daemon instances may run against the same
//! KV; coordination happens entirely through CAS locks and atomic scripts.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;

use std::time::Duration;

use driftd_core::SystemClock;
use driftd_engine::{
    run_recovery, CommandRunner, MetricsCollector, NoAuthProvider, RecoverySettings, WorkerPool,
};
use driftd_kv::{KvDriver, RedisDriver};
use driftd_store::{Scans, StackScanQueue};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;

/// Startup KV health check bound.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the metrics snapshot is written to the log.
const METRICS_LOG_EVERY: Duration = Duration::from_secs(60);

/// How long an item may sit pending before orphan recovery re-pushes it.
const ORPHAN_GRACE: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("driftd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("driftd {}", env!("CARGO_PKG_VERSION"));
                println!("Drift-detection worker daemon");
                println!();
                println!("USAGE:");
                println!("    driftd");
                println!();
                println!("Configuration comes from $DRIFTD_CONFIG (or ./driftd.toml),");
                println!("with $DRIFTD_REDIS_URL overriding the KV URL.");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: driftd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let config = Config::load()?;

    if let Some(path) = &config.log_path {
        rotate_log_if_needed(path);
    }
    let _log_guard = setup_logging(&config)?;

    info!(redis = %config.redis_url, concurrency = config.worker.concurrency, "starting driftd");

    let kv = RedisDriver::connect(&config.redis_url).await?;
    kv.ping(PING_TIMEOUT).await?;

    let clock = SystemClock;
    let runner = CommandRunner::new(config.runner_program.clone(), config.runner_args.clone());
    let pool = WorkerPool::new(
        kv.clone(),
        clock,
        runner,
        NoAuthProvider,
        config.worker.clone(),
    )?;

    let scans = Scans::new(kv.clone(), clock, config.worker.lock_ttl);
    let queue = StackScanQueue::new(kv.clone(), clock);

    // Startup reconciliation: restore the running index before consuming.
    match scans.rebuild_running_index().await {
        Ok(added) if added > 0 => info!(added, "running-scan index rebuilt"),
        Ok(_) => {}
        Err(err) => error!(error = %err, "index rebuild failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handles = pool.spawn(shutdown_rx.clone());

    let recovery = tokio::spawn(run_recovery(
        queue,
        scans,
        RecoverySettings {
            interval: config.recovery_interval,
            orphan_grace: ORPHAN_GRACE,
            stack_max_age: config.worker.stack_timeout,
            scan_max_age: config.worker.scan_max_age,
        },
        shutdown_rx.clone(),
    ));

    let metrics = MetricsCollector::new(kv.clone(), clock);
    let metrics_task = {
        let metrics = metrics.clone();
        let shutdown = shutdown_rx.clone();
        let poll = config.metrics_poll;
        tokio::spawn(async move { metrics.run(poll, shutdown).await })
    };
    let metrics_log = {
        let metrics = metrics.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_LOG_EVERY);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {}
                }
                match serde_json::to_string(&metrics.snapshot()) {
                    Ok(snapshot) => info!(%snapshot, "metrics"),
                    Err(err) => error!(error = %err, "metrics snapshot failed"),
                }
            }
        })
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    info!("driftd ready");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    // Workers finish their current attempt, then exit; no new dequeues.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = recovery.await;
    let _ = metrics_task.await;
    let _ = metrics_log.await;

    info!("driftd stopped");
    Ok(())
}

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep.
const MAX_ROTATED_LOGS: u32 = 3;

/// Rotate the log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `driftd.log` → `driftd.log.1` → `driftd.log.2` → `driftd.log.3`,
/// deleting the oldest. Rotation failures are ignored so the daemon still
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

fn setup_logging(
    config: &Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, std::io::Error> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .ok_or_else(|| std::io::Error::other("log_path has no file name"))?;
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
