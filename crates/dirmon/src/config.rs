//! Configuration for the monitor

use crate::error::{MonitorError, Result};
use crate::index::IndexConfig;
use crate::limiter::{LimiterConfig, DEFAULT_MAX_COUNT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Path to the SQLite fingerprint database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Filesystem units in flight during a scan
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,

    /// Storage queries in flight
    #[serde(default = "default_query_concurrency")]
    pub query_concurrency: usize,

    /// Delay before each scan unit starts, for throttled background scans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_delay_ms: Option<u64>,

    /// Roots registered on start
    #[serde(default)]
    pub directories: Vec<String>,
}

fn default_database_path() -> PathBuf {
    dirmon_logging::dirmon_home()
        .map(|home| home.join("dirmon.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("dirmon.sqlite3"))
}

fn default_scan_concurrency() -> usize {
    1
}

fn default_query_concurrency() -> usize {
    DEFAULT_MAX_COUNT
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scan_concurrency: default_scan_concurrency(),
            query_concurrency: default_query_concurrency(),
            dispatch_delay_ms: None,
            directories: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| MonitorError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| MonitorError::Config(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn dispatch_delay(&self) -> Option<Duration> {
        self.dispatch_delay_ms.map(Duration::from_millis)
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            query_concurrency: self.query_concurrency,
        }
    }

    pub fn scan_limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            max_count: self.scan_concurrency,
            dispatch_delay: self.dispatch_delay(),
        }
    }
}
