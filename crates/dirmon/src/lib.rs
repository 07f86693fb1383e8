//! dirmon - Metadata-Fingerprint Change Detection
//!
//! Tracks a set of root directories and reports which files under them were
//! added, changed, or removed since they were last seen.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  notifications  ┌──────────────────┐  stat/compare  ┌──────────────────┐
//! │  Filesystem  │────────────────▶│ DirectoryMonitor │───────────────▶│ FingerprintIndex │
//! │    Watch     │                 │  (scan + pumps)  │◀───────────────│    (SQLite)      │
//! └──────────────┘                 └──────────────────┘  index events  └──────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! - **Directory**: A registered root; its path is a textual prefix for ownership
//! - **FileRecord**: Last seen metadata fingerprint of one file under a root
//! - **TaskLimiter**: FIFO queue bounding concurrent scans and queries
//! - **FilesystemWatch**: Source of created/changed/removed notifications

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod limiter;
pub mod monitor;
pub mod watch;

// Re-exports for convenience
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use fingerprint::{metadata_fingerprint, subpath_fingerprint, FileStat, Fingerprint};
pub use index::{Directory, FileRecord, FingerprintIndex, IndexConfig, IndexEvent, Observation};
pub use limiter::{LimiterConfig, LimiterError, LimiterEvent, TaskHandle, TaskLimiter};
pub use monitor::{DirectoryMonitor, SaveOutcome, ScanSummary, StartReport};
pub use watch::{
    FilesystemWatch, MemoryWatch, NotifyWatch, SubscriptionHandle, WatchNotification,
    WatchSubscription,
};
