// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retrace Daemon (retraced)
//!
//! Background process that ingests agent trace events, persists them, and
//! streams them to connected viewers.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use retrace_server::{Config, Server};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config_path = PathBuf::from("./retrace.toml");
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("retraced {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("retraced {}", env!("CARGO_PKG_VERSION"));
                println!("Retrace Daemon - trace observability engine for multi-agent systems");
                println!();
                println!("USAGE:");
                println!("    retraced [--config <path>]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <path>  Configuration file (default: ./retrace.toml)");
                println!("    -h, --help           Print help information");
                println!("    -v, --version        Print version information");
                return Ok(());
            }
            "--config" | "-c" => {
                let Some(path) = args.next() else {
                    eprintln!("error: --config requires a path");
                    std::process::exit(1);
                };
                config_path = PathBuf::from(path);
            }
            other => {
                eprintln!("error: unexpected argument '{other}'");
                eprintln!("Usage: retraced [--config <path>]");
                std::process::exit(1);
            }
        }
    }

    let config = Config::load(&config_path)?;

    let _log_guard = setup_logging(&config)?;

    info!(config = %config_path.display(), "starting retraced");

    let server = Server::start(config).await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!(addr = %server.local_addr(), "retraced ready");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down...");
        }
    }

    server.shutdown().await;
    info!("retraced stopped");
    Ok(())
}

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep.
const MAX_ROTATED_LOGS: u32 = 3;

fn setup_logging(
    config: &Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, std::io::Error> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(log_dir) = &config.log_dir else {
        // No log dir configured: log to stderr.
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("retraced.log");
    rotate_log_if_needed(&log_path);

    let file_appender = tracing_appender::rolling::never(log_dir, "retraced.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(Some(guard))
}

/// Rotate the log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `retraced.log` → `.1` → `.2` → `.3`, deleting the oldest.
/// Best-effort: rotation failures do not block startup.
fn rotate_log_if_needed(log_path: &Path) {
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
