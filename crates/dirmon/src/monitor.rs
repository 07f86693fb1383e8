//! Watch orchestration.
//!
//! [`DirectoryMonitor`] keeps one watch subscription per registered
//! directory, catches up on changes made while nobody was watching by
//! scanning each root once, and funnels every notification through the same
//! stat, compare, store path. File events from the index are re-published on
//! the monitor's own channel.
//!
//! Directory registration is driven by the index: `DirAdded` starts a watch,
//! `DirDeleted` stops it. The monitor never tracks registration separately.

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::fingerprint::FileStat;
use crate::index::{FingerprintIndex, IndexEvent, Observation};
use crate::limiter::TaskLimiter;
use crate::watch::{FilesystemWatch, SubscriptionHandle, WatchNotification};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const EVENT_CAPACITY: usize = 1024;

/// Result of [`DirectoryMonitor::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub watched: Vec<String>,
    /// Claimed by a concurrent watch whose subscription has not settled yet;
    /// a later failure shows up in [`DirectoryMonitor::failed_directories`]
    pub pending: Vec<String>,
    /// `(path, reason)` for every root whose subscription failed
    pub failed: Vec<(String, String)>,
}

/// Counts from one [`DirectoryMonitor::scan_directory`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub entries: usize,
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Directories, vanished entries, and paths nobody owns any more
    pub skipped: usize,
    pub errors: usize,
}

impl ScanSummary {
    fn record(&mut self, outcome: SaveOutcome) {
        match outcome {
            SaveOutcome::Recorded(Observation::Added) => self.added += 1,
            SaveOutcome::Recorded(Observation::Changed) => self.changed += 1,
            SaveOutcome::Recorded(Observation::Unchanged) | SaveOutcome::Unchanged => {
                self.unchanged += 1
            }
            SaveOutcome::Recorded(Observation::Unowned)
            | SaveOutcome::Directory
            | SaveOutcome::Vanished => self.skipped += 1,
        }
    }
}

/// Outcome of [`DirectoryMonitor::save_if_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The path disappeared before it could be stat'd
    Vanished,
    Directory,
    /// Metadata matches the stored record, or no directory owns the path
    Unchanged,
    Recorded(Observation),
}

struct WatchEntry {
    /// Distinguishes this claim from a later re-watch of the same path
    generation: u64,
    /// `None` while the subscription is being established
    handle: Option<SubscriptionHandle>,
    pump: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WatchState {
    watched: HashMap<String, WatchEntry>,
    failed: HashMap<String, String>,
    next_generation: u64,
}

pub struct DirectoryMonitor {
    index: Arc<FingerprintIndex>,
    watcher: Arc<dyn FilesystemWatch>,
    scan_limiter: TaskLimiter,
    initial_directories: Vec<String>,
    state: Mutex<WatchState>,
    handler: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<IndexEvent>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<IndexEvent>>>,
}

impl DirectoryMonitor {
    /// Create a monitor and start listening to `index` events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        index: Arc<FingerprintIndex>,
        watcher: Arc<dyn FilesystemWatch>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let index_events = index.listen();
        let monitor = Arc::new(Self {
            index,
            watcher,
            scan_limiter: TaskLimiter::new(config.scan_limiter_config()),
            initial_directories: config.directories,
            state: Mutex::new(WatchState::default()),
            handler: Mutex::new(None),
            events,
            listeners: Mutex::new(Vec::new()),
        });

        let handler = tokio::spawn(handle_index_events(Arc::downgrade(&monitor), index_events));
        *lock(&monitor.handler) = Some(handler);
        monitor
    }

    /// Bounded file event stream; a slow receiver observes `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Every file event from now on, without loss.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<IndexEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.listeners).push(tx);
        rx
    }

    fn publish(&self, event: IndexEvent) {
        lock(&self.listeners).retain(|tx| tx.send(event.clone()).is_ok());
        let _ = self.events.send(event);
    }

    pub fn index(&self) -> &Arc<FingerprintIndex> {
        &self.index
    }

    /// Register the configured roots, then watch every known directory.
    pub async fn start(self: &Arc<Self>) -> Result<StartReport> {
        for path in &self.initial_directories {
            self.index.add_directory(path).await?;
        }

        let mut report = StartReport::default();
        for path in self.index.list_directories().await? {
            match self.watch_directory(&path).await {
                Ok(true) => report.watched.push(path),
                Ok(false) if self.is_subscribed(&path) => report.watched.push(path),
                Ok(false) => report.pending.push(path),
                Err(err) => report.failed.push((path, err.to_string())),
            }
        }
        info!(
            watched = report.watched.len(),
            pending = report.pending.len(),
            failed = report.failed.len(),
            "monitor started"
        );
        Ok(report)
    }

    /// Scan `path` in the background and subscribe to changes under it.
    ///
    /// Returns `false` if the path is already watched or being subscribed.
    pub async fn watch_directory(self: &Arc<Self>, path: &str) -> Result<bool> {
        match self.claim(path) {
            Some(generation) => self.establish(path, generation).await,
            None => Ok(false),
        }
    }

    /// Mark `path` as watched. `None` if it already was.
    fn claim(&self, path: &str) -> Option<u64> {
        let mut state = self.lock_state();
        if state.watched.contains_key(path) {
            return None;
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.watched.insert(
            path.to_string(),
            WatchEntry {
                generation,
                handle: None,
                pump: None,
            },
        );
        state.failed.remove(path);
        Some(generation)
    }

    /// Scan and subscribe for a claim made by [`Self::claim`].
    async fn establish(self: &Arc<Self>, path: &str, generation: u64) -> Result<bool> {
        let scanner = Arc::clone(self);
        let scan_root = path.to_string();
        tokio::spawn(async move {
            scanner.scan_directory(&scan_root).await;
        });

        let subscription = match self.watcher.subscribe(Path::new(path)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(path, error = %err, "failed to watch directory");
                let mut state = self.lock_state();
                if state.watched.get(path).map(|entry| entry.generation) == Some(generation) {
                    state.watched.remove(path);
                    state.failed.insert(path.to_string(), err.to_string());
                }
                return Err(match err {
                    err @ MonitorError::WatchSubscription { .. } => err,
                    other => MonitorError::watch_subscription(path, other),
                });
            }
        };

        let handle = subscription.handle;
        let attached = {
            let mut state = self.lock_state();
            match state.watched.get_mut(path) {
                Some(entry) if entry.generation == generation => {
                    entry.handle = Some(handle);
                    entry.pump = Some(tokio::spawn(pump(
                        Arc::downgrade(self),
                        subscription.notifications,
                    )));
                    true
                }
                _ => false,
            }
        };

        if !attached {
            // Unwatched while the subscription was being set up
            self.watcher.unsubscribe(handle).await?;
            return Ok(false);
        }
        info!(path, "watching directory");
        Ok(true)
    }

    /// Stop watching `path`. Returns `false` if it was not watched.
    pub async fn unwatch_directory(&self, path: &str) -> Result<bool> {
        match self.release(path) {
            Some(entry) => {
                self.close(path, entry).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release(&self, path: &str) -> Option<WatchEntry> {
        let mut state = self.lock_state();
        state.failed.remove(path);
        state.watched.remove(path)
    }

    async fn close(&self, path: &str, entry: WatchEntry) -> Result<()> {
        if let Some(pump) = entry.pump {
            pump.abort();
        }
        if let Some(handle) = entry.handle {
            self.watcher.unsubscribe(handle).await?;
        }
        info!(path, "stopped watching directory");
        Ok(())
    }

    /// Recursively check every entry under `path` against the index.
    ///
    /// An unreadable root yields an empty summary; unreadable entries below
    /// it are counted as errors and skipped.
    pub async fn scan_directory(&self, path: &str) -> ScanSummary {
        let root = PathBuf::from(path);
        let listing = match tokio::task::spawn_blocking(move || list_entries(&root)).await {
            Ok(Ok(listing)) => listing,
            Ok(Err(err)) => {
                warn!(path, error = %err, "scan root unreadable");
                return ScanSummary::default();
            }
            Err(err) => {
                warn!(path, error = %err, "scan listing task failed");
                return ScanSummary::default();
            }
        };

        let mut summary = ScanSummary {
            entries: listing.entries.len(),
            errors: listing.errors,
            ..ScanSummary::default()
        };

        let units: Vec<_> = listing
            .entries
            .into_iter()
            .map(|entry_path| {
                let index = Arc::clone(&self.index);
                // Stat on admission; the listing may be long stale by then.
                self.scan_limiter.submit(move || async move {
                    let outcome = save_if_changed(&index, &entry_path, None).await;
                    (entry_path, outcome)
                })
            })
            .collect();

        for unit in units {
            match unit.await {
                Ok((_, Ok(outcome))) => summary.record(outcome),
                Ok((entry_path, Err(err))) => {
                    summary.errors += 1;
                    warn!(path = %entry_path.display(), error = %err, "scan entry failed");
                }
                Err(err) => {
                    summary.errors += 1;
                    warn!(error = %err, "scan unit aborted");
                }
            }
        }

        info!(
            path,
            entries = summary.entries,
            added = summary.added,
            changed = summary.changed,
            errors = summary.errors,
            "scan complete"
        );
        summary
    }

    /// Stat `path` unless `stat` is given, then store it if it changed.
    pub async fn save_if_changed(&self, path: &Path, stat: Option<FileStat>) -> Result<SaveOutcome> {
        save_if_changed(&self.index, path, stat).await
    }

    pub async fn add_watched_directory(&self, path: &str) -> Result<()> {
        self.index.add_directory(path).await?;
        Ok(())
    }

    pub async fn remove_watched_directory(&self, path: &str) -> Result<bool> {
        self.index.remove_directory(path).await
    }

    /// Sorted paths currently watched or being subscribed.
    pub fn watched_directories(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.lock_state().watched.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Sorted `(path, reason)` pairs for roots whose subscription failed.
    pub fn failed_directories(&self) -> Vec<(String, String)> {
        let mut failed: Vec<_> = self
            .lock_state()
            .failed
            .iter()
            .map(|(path, reason)| (path.clone(), reason.clone()))
            .collect();
        failed.sort();
        failed
    }

    pub fn is_watching(&self, path: &str) -> bool {
        self.lock_state().watched.contains_key(path)
    }

    /// Watched with an established subscription, not just claimed.
    pub fn is_subscribed(&self, path: &str) -> bool {
        self.lock_state()
            .watched
            .get(path)
            .is_some_and(|entry| entry.handle.is_some())
    }

    /// Stop the event handler and drop every watch.
    pub async fn shutdown(&self) {
        if let Some(handler) = lock(&self.handler).take() {
            handler.abort();
        }

        let entries: Vec<_> = self.lock_state().watched.drain().collect();
        for (path, entry) in entries {
            if let Some(pump) = entry.pump {
                pump.abort();
            }
            if let Some(handle) = entry.handle {
                if let Err(err) = self.watcher.unsubscribe(handle).await {
                    warn!(path = %path, error = %err, "failed to unsubscribe");
                }
            }
        }
        info!("monitor stopped");
    }

    fn lock_state(&self) -> MutexGuard<'_, WatchState> {
        lock(&self.state)
    }
}

impl Drop for DirectoryMonitor {
    fn drop(&mut self) {
        if let Some(handler) = lock(&self.handler).take() {
            handler.abort();
        }
        for entry in lock(&self.state).watched.values_mut() {
            if let Some(pump) = entry.pump.take() {
                pump.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn save_if_changed(
    index: &FingerprintIndex,
    path: &Path,
    stat: Option<FileStat>,
) -> Result<SaveOutcome> {
    let stat = match stat {
        Some(stat) => stat,
        None => match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => FileStat::from_metadata(&metadata),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "vanished before stat");
                return Ok(SaveOutcome::Vanished);
            }
            Err(err) => return Err(err.into()),
        },
    };
    if stat.is_dir {
        return Ok(SaveOutcome::Directory);
    }

    let key = path_key(path);
    if !index.check_changed(&key, &stat).await? {
        return Ok(SaveOutcome::Unchanged);
    }
    Ok(SaveOutcome::Recorded(index.record_observation(&key, &stat).await?))
}

struct Listing {
    entries: Vec<PathBuf>,
    errors: usize,
}

/// Walk `root` in listing order. Fails only when the root itself is unreadable.
fn list_entries(root: &Path) -> Result<Listing> {
    let mut listing = Listing {
        entries: Vec::new(),
        errors: 0,
    };

    for item in WalkDir::new(root).min_depth(1) {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry");
                listing.errors += 1;
                continue;
            }
        };
        listing.entries.push(entry.into_path());
    }
    Ok(listing)
}

async fn pump(monitor: Weak<DirectoryMonitor>, mut notifications: mpsc::UnboundedReceiver<WatchNotification>) {
    while let Some(notification) = notifications.recv().await {
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        match notification {
            WatchNotification::Created { path, stat } | WatchNotification::Changed { path, stat } => {
                if let Err(err) = monitor.save_if_changed(&path, stat).await {
                    warn!(path = %path.display(), error = %err, "failed to record change");
                }
            }
            WatchNotification::Removed { path } => {
                if let Err(err) = monitor.index.delete_record(&path_key(&path)).await {
                    warn!(path = %path.display(), error = %err, "failed to record removal");
                }
            }
        }
    }
}

async fn handle_index_events(
    monitor: Weak<DirectoryMonitor>,
    mut events: mpsc::UnboundedReceiver<IndexEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(monitor) = monitor.upgrade() else {
            break;
        };

        match event {
            IndexEvent::DirAdded(path) => {
                // Claimed here so a following DirDeleted finds the entry.
                if let Some(generation) = monitor.claim(&path) {
                    tokio::spawn(async move {
                        // Failures are already recorded in the monitor's error set.
                        let _ = monitor.establish(&path, generation).await;
                    });
                }
            }
            IndexEvent::DirDeleted(path) => {
                if let Some(entry) = monitor.release(&path) {
                    tokio::spawn(async move {
                        if let Err(err) = monitor.close(&path, entry).await {
                            warn!(path = %path, error = %err, "failed to stop watching");
                        }
                    });
                }
            }
            event @ (IndexEvent::FileAdded { .. }
            | IndexEvent::FileChanged { .. }
            | IndexEvent::FileDeleted(_)) => {
                monitor.publish(event);
            }
        }
    }
}
