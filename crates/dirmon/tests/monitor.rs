//! Monitor scenarios driven through the in-memory watcher.

use async_trait::async_trait;
use dirmon::{
    DirectoryMonitor, FileStat, FilesystemWatch, FingerprintIndex, IndexConfig, IndexEvent,
    MemoryWatch, MonitorConfig, MonitorError, SaveOutcome, ScanSummary, SubscriptionHandle,
    WatchNotification, WatchSubscription,
};
use dirmon_db::SqliteBackend;
use filetime::FileTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    index: Arc<FingerprintIndex>,
    watch: Arc<MemoryWatch>,
}

impl Fixture {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let backend = SqliteBackend::open_in_memory().await.unwrap();
        let index = Arc::new(FingerprintIndex::new(Arc::new(backend), IndexConfig::default()));
        index.setup().await.unwrap();
        Self {
            _tmp: tmp,
            root,
            index,
            watch: Arc::new(MemoryWatch::new()),
        }
    }

    fn root_key(&self) -> String {
        key(&self.root)
    }

    fn monitor(&self) -> Arc<DirectoryMonitor> {
        let config = MonitorConfig {
            database_path: self.root.join("unused.sqlite3"),
            ..MonitorConfig::default()
        };
        DirectoryMonitor::new(Arc::clone(&self.index), self.watch.clone(), config)
    }
}

/// Holds subscriptions to one root until the test releases them.
struct GatedWatch {
    inner: MemoryWatch,
    gated: PathBuf,
    gate: Semaphore,
}

impl GatedWatch {
    fn new(gated: PathBuf) -> Self {
        Self {
            inner: MemoryWatch::new(),
            gated,
            gate: Semaphore::new(0),
        }
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl FilesystemWatch for GatedWatch {
    async fn subscribe(&self, path: &Path) -> dirmon::Result<WatchSubscription> {
        if path == self.gated {
            self.gate.acquire().await.unwrap().forget();
        }
        self.inner.subscribe(path).await
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> dirmon::Result<()> {
        self.inner.unsubscribe(handle).await
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn next_event(events: &mut broadcast::Receiver<IndexEvent>) -> IndexEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_listened(events: &mut mpsc::UnboundedReceiver<IndexEvent>) -> IndexEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let polled = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting until {}", what);
}

#[tokio::test]
async fn test_start_scans_existing_files() {
    let fx = Fixture::new().await;
    std::fs::write(fx.root.join("a.txt"), b"a").unwrap();
    std::fs::create_dir(fx.root.join("sub")).unwrap();
    std::fs::write(fx.root.join("sub").join("b.txt"), b"bb").unwrap();
    fx.index.add_directory(&fx.root_key()).await.unwrap();

    let monitor = fx.monitor();
    let mut events = monitor.subscribe();
    let report = monitor.start().await.unwrap();
    assert_eq!(report.watched, vec![fx.root_key()]);
    assert!(report.failed.is_empty());
    assert!(fx.watch.is_subscribed(&fx.root));

    let mut added = Vec::new();
    for _ in 0..2 {
        match next_event(&mut events).await {
            IndexEvent::FileAdded { path, .. } => added.push(path),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    added.sort();
    assert_eq!(
        added,
        vec![key(&fx.root.join("a.txt")), key(&fx.root.join("sub").join("b.txt"))]
    );
}

#[tokio::test]
async fn test_scan_reports_added_unchanged_and_changed() {
    let fx = Fixture::new().await;
    let file = fx.root.join("a.txt");
    std::fs::write(&file, b"a").unwrap();
    std::fs::create_dir(fx.root.join("sub")).unwrap();
    std::fs::write(fx.root.join("sub").join("b.txt"), b"bb").unwrap();
    fx.index.add_directory(&fx.root_key()).await.unwrap();
    // Not started, so no background scan competes with these.
    let monitor = fx.monitor();

    let first = monitor.scan_directory(&fx.root_key()).await;
    assert_eq!(
        first,
        ScanSummary {
            entries: 3,
            added: 2,
            skipped: 1,
            ..ScanSummary::default()
        }
    );

    let second = monitor.scan_directory(&fx.root_key()).await;
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.added + second.changed, 0);

    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
    let third = monitor.scan_directory(&fx.root_key()).await;
    assert_eq!(third.changed, 1);
    assert_eq!(third.unchanged, 1);
}

#[tokio::test]
async fn test_scan_missing_root_is_empty() {
    let fx = Fixture::new().await;
    let monitor = fx.monitor();
    let summary = monitor
        .scan_directory(&key(&fx.root.join("does-not-exist")))
        .await;
    assert_eq!(summary, ScanSummary::default());
}

#[tokio::test]
async fn test_notifications_flow_to_file_events() {
    let fx = Fixture::new().await;
    fx.index.add_directory(&fx.root_key()).await.unwrap();
    let monitor = fx.monitor();
    let mut events = monitor.subscribe();
    monitor.start().await.unwrap();

    // Only ever seen through notifications, never on disk
    let path = fx.root.join("virtual.txt");
    let created = FileStat::regular_file(10, 1_000);
    fx.watch.emit(WatchNotification::Created {
        path: path.clone(),
        stat: Some(created),
    });
    assert_eq!(
        next_event(&mut events).await,
        IndexEvent::FileAdded {
            path: key(&path),
            stat: created
        }
    );

    let changed = FileStat::regular_file(20, 2_000);
    fx.watch.emit(WatchNotification::Changed {
        path: path.clone(),
        stat: Some(changed),
    });
    assert_eq!(
        next_event(&mut events).await,
        IndexEvent::FileChanged {
            path: key(&path),
            stat: changed
        }
    );

    fx.watch.emit(WatchNotification::Removed { path: path.clone() });
    assert_eq!(next_event(&mut events).await, IndexEvent::FileDeleted(key(&path)));
}

#[tokio::test]
async fn test_created_notification_stats_real_file() {
    let fx = Fixture::new().await;
    fx.index.add_directory(&fx.root_key()).await.unwrap();
    let monitor = fx.monitor();
    let mut events = monitor.subscribe();
    monitor.start().await.unwrap();

    let path = fx.root.join("real.txt");
    std::fs::write(&path, b"hello").unwrap();
    fx.watch.emit(WatchNotification::Created {
        path: path.clone(),
        stat: None,
    });

    // The background scan may record it first; either way exactly one add.
    match next_event(&mut events).await {
        IndexEvent::FileAdded { path: added, stat } => {
            assert_eq!(added, key(&path));
            assert_eq!(stat.size, 5);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_save_if_changed_skips_directories_and_vanished_paths() {
    let fx = Fixture::new().await;
    fx.index.add_directory(&fx.root_key()).await.unwrap();
    std::fs::create_dir(fx.root.join("sub")).unwrap();
    let monitor = fx.monitor();

    assert_eq!(
        monitor.save_if_changed(&fx.root.join("sub"), None).await.unwrap(),
        SaveOutcome::Directory
    );
    assert_eq!(
        monitor.save_if_changed(&fx.root.join("gone.txt"), None).await.unwrap(),
        SaveOutcome::Vanished
    );
}

#[tokio::test]
async fn test_subscription_failure_is_recorded() {
    let fx = Fixture::new().await;
    fx.index.add_directory(&fx.root_key()).await.unwrap();
    fx.watch.fail_on(fx.root.clone(), "permission denied");

    let monitor = fx.monitor();
    let report = monitor.start().await.unwrap();
    assert!(report.watched.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, fx.root_key());
    assert!(report.failed[0].1.contains("permission denied"));

    assert!(!monitor.is_watching(&fx.root_key()));
    assert_eq!(monitor.failed_directories().len(), 1);

    let err = monitor.watch_directory(&fx.root_key()).await.unwrap_err();
    assert!(matches!(err, MonitorError::WatchSubscription { .. }));

    // Retrying after the cause clears succeeds and forgets the failure.
    fx.watch.clear_failure(&fx.root);
    assert!(monitor.watch_directory(&fx.root_key()).await.unwrap());
    assert!(monitor.failed_directories().is_empty());
    assert_eq!(monitor.watched_directories(), vec![fx.root_key()]);
}

#[tokio::test]
async fn test_watch_directory_is_idempotent() {
    let fx = Fixture::new().await;
    fx.index.add_directory(&fx.root_key()).await.unwrap();
    let monitor = fx.monitor();

    assert!(monitor.watch_directory(&fx.root_key()).await.unwrap());
    assert!(!monitor.watch_directory(&fx.root_key()).await.unwrap());
    assert_eq!(fx.watch.subscription_count(), 1);

    assert!(monitor.unwatch_directory(&fx.root_key()).await.unwrap());
    assert!(!monitor.unwatch_directory(&fx.root_key()).await.unwrap());
    assert_eq!(fx.watch.subscription_count(), 0);
}

#[tokio::test]
async fn test_registered_directories_drive_watch_state() {
    let fx = Fixture::new().await;
    let monitor = fx.monitor();
    let report = monitor.start().await.unwrap();
    assert!(report.watched.is_empty());

    monitor.add_watched_directory(&fx.root_key()).await.unwrap();
    wait_until("watching after add", || {
        fx.watch.is_subscribed(&fx.root) && monitor.is_watching(&fx.root_key())
    })
    .await;

    assert!(monitor.remove_watched_directory(&fx.root_key()).await.unwrap());
    wait_until("stopped after remove", || {
        !fx.watch.is_subscribed(&fx.root) && !monitor.is_watching(&fx.root_key())
    })
    .await;
}

#[tokio::test]
async fn test_configured_directories_registered_on_start() {
    let fx = Fixture::new().await;
    let config = MonitorConfig {
        database_path: fx.root.join("unused.sqlite3"),
        directories: vec![fx.root_key()],
        ..MonitorConfig::default()
    };
    let monitor = DirectoryMonitor::new(Arc::clone(&fx.index), fx.watch.clone(), config);

    let report = monitor.start().await.unwrap();
    // The registration event may claim the root before start gets to it.
    assert_eq!([report.watched, report.pending].concat(), vec![fx.root_key()]);
    assert_eq!(fx.index.list_directories().await.unwrap(), vec![fx.root_key()]);
    wait_until("subscribed", || monitor.is_subscribed(&fx.root_key())).await;
    assert_eq!(fx.watch.subscription_count(), 1);
}

#[tokio::test]
async fn test_shutdown_unsubscribes_everything() {
    let fx = Fixture::new().await;
    fx.index.add_directory(&fx.root_key()).await.unwrap();
    let monitor = fx.monitor();
    monitor.start().await.unwrap();
    assert_eq!(fx.watch.subscription_count(), 1);

    monitor.shutdown().await;
    assert_eq!(fx.watch.subscription_count(), 0);
    assert!(monitor.watched_directories().is_empty());
}

#[tokio::test]
async fn test_scan_stats_entries_when_admitted() {
    let fx = Fixture::new().await;
    for name in ["a.txt", "b.txt"] {
        std::fs::write(fx.root.join(name), b"x").unwrap();
    }
    let dir = fx.index.add_directory(&fx.root_key()).await.unwrap();
    let config = MonitorConfig {
        database_path: fx.root.join("unused.sqlite3"),
        dispatch_delay_ms: Some(300),
        ..MonitorConfig::default()
    };
    let monitor = DirectoryMonitor::new(Arc::clone(&fx.index), fx.watch.clone(), config);

    let scanner = Arc::clone(&monitor);
    let root = fx.root_key();
    let scan = tokio::spawn(async move { scanner.scan_directory(&root).await });

    // Listed by now, but no unit has run yet.
    tokio::time::sleep(Duration::from_millis(150)).await;
    for name in ["a.txt", "b.txt"] {
        std::fs::remove_file(fx.root.join(name)).unwrap();
    }

    let summary = scan.await.unwrap();
    assert_eq!(summary.entries, 2);
    assert_eq!(summary.added, 0);
    assert_eq!(summary.skipped, 2);
    assert_eq!(fx.index.find_record(&dir, "/a.txt").await.unwrap(), None);
    assert_eq!(fx.index.find_record(&dir, "/b.txt").await.unwrap(), None);
}

#[tokio::test]
async fn test_slow_subscription_does_not_stall_events() {
    let fx = Fixture::new().await;
    let slow = fx.root.join("slow");
    let later = fx.root.join("later");
    let bulk = fx.root.join("bulk");
    let watch = Arc::new(GatedWatch::new(slow.clone()));
    let config = MonitorConfig {
        database_path: fx.root.join("unused.sqlite3"),
        ..MonitorConfig::default()
    };
    let monitor = DirectoryMonitor::new(Arc::clone(&fx.index), watch.clone(), config);
    let mut events = monitor.listen();
    monitor.start().await.unwrap();

    monitor.add_watched_directory(&key(&slow)).await.unwrap();
    monitor.add_watched_directory(&key(&later)).await.unwrap();
    wait_until("later subscribed", || monitor.is_subscribed(&key(&later))).await;
    assert!(monitor.is_watching(&key(&slow)));
    assert!(!monitor.is_subscribed(&key(&slow)));

    // Well past the broadcast capacity
    const BURST: usize = 1100;
    monitor.add_watched_directory(&key(&bulk)).await.unwrap();
    let stat = FileStat::regular_file(1, 1);
    for i in 0..BURST {
        fx.index
            .record_observation(&key(&bulk.join(format!("{}.txt", i))), &stat)
            .await
            .unwrap();
    }

    for i in 0..BURST {
        match next_listened(&mut events).await {
            IndexEvent::FileAdded { path, .. } => {
                assert_eq!(path, key(&bulk.join(format!("{}.txt", i))));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    watch.release();
    wait_until("slow subscribed", || monitor.is_subscribed(&key(&slow))).await;
    assert_eq!(watch.inner.subscription_count(), 3);
}

#[tokio::test]
async fn test_start_reports_pending_subscription() {
    let fx = Fixture::new().await;
    let watch = Arc::new(GatedWatch::new(fx.root.clone()));
    let config = MonitorConfig {
        database_path: fx.root.join("unused.sqlite3"),
        ..MonitorConfig::default()
    };
    let monitor = DirectoryMonitor::new(Arc::clone(&fx.index), watch.clone(), config);

    monitor.add_watched_directory(&fx.root_key()).await.unwrap();
    wait_until("root claimed", || monitor.is_watching(&fx.root_key())).await;

    let report = monitor.start().await.unwrap();
    assert!(report.watched.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(report.pending, vec![fx.root_key()]);

    watch.release();
    wait_until("root subscribed", || monitor.is_subscribed(&fx.root_key())).await;
    assert!(monitor.failed_directories().is_empty());
}
