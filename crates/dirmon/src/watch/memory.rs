use super::{FilesystemWatch, SubscriptionHandle, WatchNotification, WatchSubscription};
use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// In-memory watcher. Notifications are injected with [`MemoryWatch::emit`].
#[derive(Default)]
pub struct MemoryWatch {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    subscriptions: HashMap<SubscriptionHandle, Subscriber>,
    /// Roots whose next subscribe fails, with the reason reported
    failures: HashMap<PathBuf, String>,
}

struct Subscriber {
    root: PathBuf,
    tx: mpsc::UnboundedSender<WatchNotification>,
}

impl MemoryWatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subscriptions to `root` fail until [`MemoryWatch::clear_failure`].
    pub fn fail_on(&self, root: impl Into<PathBuf>, reason: impl Into<String>) {
        self.lock().failures.insert(root.into(), reason.into());
    }

    pub fn clear_failure(&self, root: &Path) {
        self.lock().failures.remove(root);
    }

    pub fn is_subscribed(&self, root: &Path) -> bool {
        self.lock().subscriptions.values().any(|sub| sub.root == root)
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Deliver `notification` to every subscription whose root contains its
    /// path. Returns how many subscriptions received it.
    pub fn emit(&self, notification: WatchNotification) -> usize {
        let inner = self.lock();
        inner
            .subscriptions
            .values()
            .filter(|sub| notification.path().starts_with(&sub.root))
            .filter(|sub| sub.tx.send(notification.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl FilesystemWatch for MemoryWatch {
    async fn subscribe(&self, path: &Path) -> Result<WatchSubscription> {
        let mut inner = self.lock();
        if let Some(reason) = inner.failures.get(path) {
            return Err(MonitorError::watch_subscription(
                path.display().to_string(),
                reason,
            ));
        }

        let handle = SubscriptionHandle::new(inner.next_id);
        inner.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscriptions.insert(
            handle,
            Subscriber {
                root: path.to_path_buf(),
                tx,
            },
        );
        Ok(WatchSubscription {
            handle,
            notifications: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.lock().subscriptions.remove(&handle);
        Ok(())
    }
}
