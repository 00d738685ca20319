use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Environment variable overriding the configured log filter.
const LOG_ENV: &str = "PWA_CACHE_LOG";

/// Route `tracing` output to a daily log file so stdout stays reserved for
/// command output.
///
/// The returned guard flushes buffered lines on drop; keep it alive for the
/// life of the process.
pub fn init(config: &Config) -> Result<WorkerGuard> {
  let dir = config.log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "pwa-cache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV)
    .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_deref().unwrap_or("info")));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
