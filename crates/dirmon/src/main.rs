//! dirmon CLI
//!
//! Watches the registered directories and prints file events until Ctrl-C.
//!
//! Usage:
//!     dirmon --add ~/Documents
//!     dirmon --config dirmon.toml --db /tmp/dirmon.sqlite3 -v

use anyhow::Context;
use clap::Parser;
use dirmon::{DirectoryMonitor, FingerprintIndex, IndexEvent, MonitorConfig, NotifyWatch};
use dirmon_db::SqliteBackend;
use dirmon_logging::{init_logging, logs_dir, LogConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dirmon", about = "Watch directories and report changed files")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "DIRMON_CONFIG")]
    config: Option<PathBuf>,

    /// Fingerprint database (overrides the config file)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Register a directory before starting (repeatable)
    #[arg(long = "add", value_name = "DIR")]
    add: Vec<String>,

    /// Unregister a directory before starting (repeatable)
    #[arg(long = "remove", value_name = "DIR")]
    remove: Vec<String>,

    /// Also write a daily log file under ~/.dirmon/logs
    #[arg(long)]
    log_file: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _log_guard = init_logging(LogConfig {
        app_name: "dirmon",
        verbose: args.verbose,
        log_dir: if args.log_file { logs_dir() } else { None },
    })?;

    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    if let Some(db) = args.db {
        config.database_path = db;
    }
    config.directories.extend(args.add);

    info!(database = %config.database_path.display(), "opening fingerprint index");
    let backend = SqliteBackend::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database: {}", config.database_path.display()))?;
    let index = Arc::new(FingerprintIndex::new(Arc::new(backend), config.index_config()));
    index.setup().await.context("Failed to create schema")?;

    for path in &args.remove {
        if !index.remove_directory(path).await? {
            warn!(path = %path, "not a registered directory");
        }
    }

    let monitor = DirectoryMonitor::new(Arc::clone(&index), Arc::new(NotifyWatch::new()), config);
    let mut events = monitor.listen();
    let report = monitor.start().await.context("Failed to start monitor")?;
    for (path, reason) in &report.failed {
        eprintln!("not watching {}: {}", path, reason);
    }
    for path in &report.pending {
        info!(path = %path, "subscription still pending");
    }
    if report.watched.is_empty() && report.pending.is_empty() {
        eprintln!("no directories registered; pass --add DIR");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(IndexEvent::FileAdded { path, .. }) => println!("added   {}", path),
                Some(IndexEvent::FileChanged { path, .. }) => println!("changed {}", path),
                Some(IndexEvent::FileDeleted(path)) => println!("deleted {}", path),
                Some(_) => {}
                None => break,
            },
        }
    }

    monitor.shutdown().await;
    Ok(())
}
