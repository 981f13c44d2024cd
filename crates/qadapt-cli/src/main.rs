//! QAdapt CLI - command-line access to the QAdapt self-healing test
//! automation dashboard.
//!
//! Logs in, keeps the session alive across runs, and forwards authenticated
//! requests to the QAdapt API.

mod app;
mod commands;

use std::io;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::{failure_message, App};
use commands::Command;

/// Set to enable the daily-rolling log file in the cache directory
const LOG_FILE_ENV: &str = "QADAPT_LOG_FILE";

/// Initialize the tracing subscriber for logging.
/// Returns the file writer guard, which must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_dir = std::env::var(LOG_FILE_ENV)
        .ok()
        .filter(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .and_then(|_| qadapt_core::Config::default().cache_dir().ok())
        .map(|dir| dir.join("logs"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "qadapt.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
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
async fn main() {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    info!(?command, "QAdapt CLI starting");
    let result = match App::new() {
        Ok(mut app) => app.run(command).await,
        Err(e) => Err(e.context("Failed to start")),
    };

    if let Err(e) = result {
        eprintln!("{}", failure_message(&e));
        // Flush the log file before exiting
        drop(log_guard);
        std::process::exit(1);
    }
}
