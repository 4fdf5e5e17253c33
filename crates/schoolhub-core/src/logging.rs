//! Tracing setup.
//!
//! Logs go to `<dir>/schoolhub.log` so stdout stays reserved for command output.
//! The filter comes from `SCHOOLHUB_LOG` (same syntax as `RUST_LOG`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "SCHOOLHUB_LOG";
pub const LOG_FILE: &str = "schoolhub.log";
const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber writing to a log file in `dir`.
///
/// Keep the returned guard alive for the lifetime of the process; dropping it
/// flushes and stops the background writer.
///
/// # Errors
/// Fails if the directory cannot be created or a subscriber is already set.
pub fn init(dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
