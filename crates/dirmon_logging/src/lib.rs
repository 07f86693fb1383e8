//! Shared logging utilities for dirmon binaries.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "dirmon=info,dirmon_db=info";

/// Logging configuration shared by dirmon binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Directory for the daily rolling log file. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

/// Initialize tracing with stderr output and an optional rolling log file.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init_logging(config: LogConfig<'_>) -> Result<Option<WorkerGuard>> {
    let base_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    let console_filter = if config.verbose {
        EnvFilter::new("dirmon=debug,dirmon_db=debug")
    } else {
        base_filter()
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    match config.log_dir {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
            let appender =
                tracing_appender::rolling::daily(&dir, format!("{}.log", sanitize_name(config.app_name)));
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(console_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(base_filter()),
                )
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(console_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}

/// Get the dirmon home directory: ~/.dirmon (or `$DIRMON_HOME`)
pub fn dirmon_home() -> Option<PathBuf> {
    if let Ok(override_path) = std::env::var("DIRMON_HOME") {
        return Some(PathBuf::from(override_path));
    }
    dirs::home_dir().map(|home| home.join(".dirmon"))
}

/// Get the default logs directory: ~/.dirmon/logs
pub fn logs_dir() -> Option<PathBuf> {
    dirmon_home().map(|home| home.join("logs"))
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
