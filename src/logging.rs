//! Tracing setup. Logs go to a daily file so stdout stays free for results.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "questsync.log";
const DEFAULT_FILTER: &str = "questsync=info";

/// Install the global subscriber writing under `log_dir`.
///
/// `RUST_LOG` wins over `default_filter`. Keep the returned guard alive for
/// the lifetime of the process or buffered lines are lost.
pub fn init(log_dir: &Path, default_filter: Option<&str>) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or(DEFAULT_FILTER)))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(env_filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  tracing::info!(log_dir = %log_dir.display(), "Logging initialized");
  Ok(guard)
}
