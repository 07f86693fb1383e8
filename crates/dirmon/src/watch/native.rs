use super::{FilesystemWatch, SubscriptionHandle, WatchNotification, WatchSubscription};
use crate::error::{MonitorError, Result};
use crate::fingerprint::FileStat;
use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// OS-backed recursive watcher, one `notify` watcher per subscription.
#[derive(Default)]
pub struct NotifyWatch {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<SubscriptionHandle, RecommendedWatcher>>,
}

impl NotifyWatch {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FilesystemWatch for NotifyWatch {
    async fn subscribe(&self, path: &Path) -> Result<WatchSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let root = path.display().to_string();
        let target = path.to_path_buf();
        let label = root.clone();

        // Setting up a recursive watch walks the tree on some platforms.
        let watcher = tokio::task::spawn_blocking(move || -> Result<RecommendedWatcher> {
            let mut watcher = RecommendedWatcher::new(
                move |result: notify::Result<Event>| match result {
                    Ok(event) => {
                        for notification in translate(event) {
                            // Receiver gone means the subscription is being torn down.
                            if tx.send(notification).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "filesystem watcher error"),
                },
                Config::default(),
            )
            .map_err(|err| MonitorError::watch_subscription(label.clone(), err))?;

            watcher
                .watch(&target, RecursiveMode::Recursive)
                .map_err(|err| MonitorError::watch_subscription(label, err))?;
            Ok(watcher)
        })
        .await??;

        let handle = SubscriptionHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, watcher);
        debug!(path = %root, handle = handle.id(), "watch subscribed");

        Ok(WatchSubscription {
            handle,
            notifications: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let removed = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        if let Some(watcher) = removed {
            // Dropping joins the platform watcher thread.
            tokio::task::spawn_blocking(move || drop(watcher)).await?;
            debug!(handle = handle.id(), "watch unsubscribed");
        }
        Ok(())
    }
}

fn stat(path: &Path) -> Option<FileStat> {
    std::fs::symlink_metadata(path)
        .ok()
        .map(|metadata| FileStat::from_metadata(&metadata))
}

fn created(path: PathBuf) -> WatchNotification {
    let stat = stat(&path);
    WatchNotification::Created { path, stat }
}

/// Map a raw `notify` event onto zero or more notifications.
///
/// Renames become a removal of the old path and a creation of the new one.
fn translate(event: Event) -> Vec<WatchNotification> {
    let mut paths = event.paths.into_iter();
    match event.kind {
        EventKind::Create(_) => paths.map(created).collect(),
        EventKind::Remove(_) => paths.map(|path| WatchNotification::Removed { path }).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.map(|path| WatchNotification::Removed { path }).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths.map(created).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                out.push(WatchNotification::Removed { path: from });
            }
            if let Some(to) = paths.next() {
                out.push(created(to));
            }
            out
        }
        // Backends that cannot tell which side of a rename they saw
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .map(|path| match stat(&path) {
                Some(stat) => WatchNotification::Created {
                    path,
                    stat: Some(stat),
                },
                None => WatchNotification::Removed { path },
            })
            .collect(),
        EventKind::Modify(_) => paths
            .map(|path| {
                let stat = stat(&path);
                WatchNotification::Changed { path, stat }
            })
            .collect(),
        other => {
            trace!(kind = ?other, "ignoring watch event");
            Vec::new()
        }
    }
}
