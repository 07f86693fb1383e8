//! Filesystem watch primitive.
//!
//! A [`FilesystemWatch`] turns a root path into a stream of normalized
//! [`WatchNotification`]s. [`NotifyWatch`] backs it with the OS watcher;
//! [`MemoryWatch`] is driven by hand.

mod memory;
mod native;

pub use self::memory::MemoryWatch;
pub use self::native::NotifyWatch;

use crate::error::Result;
use crate::fingerprint::FileStat;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotification {
    /// `stat` is `None` when the watcher could not stat the path
    Created { path: PathBuf, stat: Option<FileStat> },
    Changed { path: PathBuf, stat: Option<FileStat> },
    Removed { path: PathBuf },
}

impl WatchNotification {
    pub fn path(&self) -> &Path {
        match self {
            Self::Created { path, .. } | Self::Changed { path, .. } | Self::Removed { path } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A live subscription. Dropping the receiver does not detach the watch;
/// call [`FilesystemWatch::unsubscribe`].
#[derive(Debug)]
pub struct WatchSubscription {
    pub handle: SubscriptionHandle,
    pub notifications: mpsc::UnboundedReceiver<WatchNotification>,
}

#[async_trait]
pub trait FilesystemWatch: Send + Sync {
    /// Watch `path` recursively.
    async fn subscribe(&self, path: &Path) -> Result<WatchSubscription>;

    /// Detach a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}
