//! rollcall - check in at the gym, online or not.
//!
//! Every command opens the signed-in user's attendance core, performs one
//! intent, drains the queue if the network is available, and exits. Queued
//! events are kept on disk until a later run delivers them.

mod commands;

use std::io;
use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Cli;
use rollcall_core::Config;

/// Log file prefix under `<data_dir>/logs`
const LOG_FILE_PREFIX: &str = "rollcall.log";

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=rollcall_core=debug).
/// Logs go to stderr and, when the data directory is writable, to a daily
/// rotated file; the returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if cli.offline {
        config.offline = true;
    }

    let log_dir = config.data_dir().ok().map(|dir| dir.join("logs"));
    let _guard = init_tracing(log_dir.as_deref());
    info!("rollcall starting");

    if let Err(e) = cli.execute(config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
