//! Persisted fingerprint index.
//!
//! Answers "has this path changed since it was last seen" for paths under a
//! set of registered root directories, and records the new state when it has.
//! Every storage query is admitted through a [`TaskLimiter`] so a bulk scan
//! never has more than `query_concurrency` queries outstanding.

use crate::error::{MonitorError, Result};
use crate::fingerprint::{metadata_fingerprint, subpath_fingerprint, FileStat, Fingerprint};
use crate::limiter::{LimiterConfig, TaskLimiter, DEFAULT_MAX_COUNT};
use chrono::Utc;
use dirmon_db::{BackendError, DbRow, Statement, StorageBackend};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 1024;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS directories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL,
        seq INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        directory_id INTEGER NOT NULL,
        subpath TEXT NOT NULL,
        subpath_hash BLOB NOT NULL,
        statdate INTEGER NOT NULL,
        stathash BLOB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS directory_id ON files(directory_id)",
    "CREATE INDEX IF NOT EXISTS subpath_hash ON files(subpath_hash)",
    "CREATE UNIQUE INDEX IF NOT EXISTS directory_subpath ON files(directory_id, subpath)",
];

/// A registered root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub id: i64,
    /// Textual prefix matched against observed paths
    pub path: String,
    pub watch_sequence: Option<i64>,
}

impl Directory {
    pub fn owns(&self, path: &str) -> bool {
        path.starts_with(&self.path)
    }

    /// Strip this directory's path from `path`. Caller checks [`Directory::owns`] first.
    pub fn subpath<'a>(&self, path: &'a str) -> &'a str {
        path.get(self.path.len()..).unwrap_or_default()
    }

    fn from_row(row: &DbRow) -> std::result::Result<Self, BackendError> {
        Ok(Self {
            id: row.get_by_name("id")?,
            path: row.get_by_name("path")?,
            watch_sequence: row.get_by_name("seq")?,
        })
    }
}

/// Last observed state of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub directory_id: i64,
    pub subpath: String,
    pub subpath_fingerprint: Fingerprint,
    pub metadata_fingerprint: Fingerprint,
    /// Milliseconds since epoch
    pub last_checked_at: i64,
}

impl FileRecord {
    fn from_row(row: &DbRow) -> std::result::Result<Self, BackendError> {
        let fingerprint = |column: &str| -> std::result::Result<Fingerprint, BackendError> {
            let bytes: Vec<u8> = row.get_by_name(column)?;
            Fingerprint::from_slice(&bytes).ok_or_else(|| {
                BackendError::type_conversion(format!(
                    "Column '{}' holds {} bytes, expected 32",
                    column,
                    bytes.len()
                ))
            })
        };

        Ok(Self {
            id: row.get_by_name("id")?,
            directory_id: row.get_by_name("directory_id")?,
            subpath: row.get_by_name("subpath")?,
            subpath_fingerprint: fingerprint("subpath_hash")?,
            metadata_fingerprint: fingerprint("stathash")?,
            last_checked_at: row.get_by_name("statdate")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum storage queries in flight
    pub query_concurrency: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            query_concurrency: DEFAULT_MAX_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    DirAdded(String),
    DirDeleted(String),
    FileAdded { path: String, stat: FileStat },
    FileChanged { path: String, stat: FileStat },
    FileDeleted(String),
}

/// Outcome of [`FingerprintIndex::record_observation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// No registered directory owns the path
    Unowned,
    Added,
    Changed,
    Unchanged,
}

type DirectoryList = Arc<Vec<Directory>>;

/// In-memory directory list with single-flight loading.
///
/// The current cell is either empty, being filled by exactly one loader, or
/// filled. Invalidation swaps in a fresh cell; a load still running against
/// the old cell finishes into a cell nobody reads again.
#[derive(Default)]
struct DirectoryCache {
    cell: Mutex<Arc<OnceCell<DirectoryList>>>,
}

impl DirectoryCache {
    fn current(&self) -> Arc<OnceCell<DirectoryList>> {
        Arc::clone(&self.cell.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn invalidate(&self) {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(OnceCell::new());
    }
}

pub struct FingerprintIndex {
    backend: Arc<dyn StorageBackend>,
    limiter: TaskLimiter,
    cache: DirectoryCache,
    /// Serializes add/remove so a check-then-insert cannot interleave
    directory_writes: tokio::sync::Mutex<()>,
    events: broadcast::Sender<IndexEvent>,
    /// Unbounded per-listener queues; closed ones are pruned on emit
    listeners: Mutex<Vec<mpsc::UnboundedSender<IndexEvent>>>,
}

impl FingerprintIndex {
    pub fn new(backend: Arc<dyn StorageBackend>, config: IndexConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            limiter: TaskLimiter::new(LimiterConfig::with_max_count(config.query_concurrency)),
            cache: DirectoryCache::default(),
            directory_writes: tokio::sync::Mutex::new(()),
            events,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Create the schema if it does not exist yet.
    pub async fn setup(&self) -> Result<()> {
        let statements = SCHEMA.iter().map(|sql| Statement::new(*sql)).collect();
        self.serialize(statements).await?;
        debug!(backend = self.backend.backend_name(), "fingerprint index schema ready");
        Ok(())
    }

    /// Bounded fan-out of index events. A receiver that falls more than the
    /// channel capacity behind observes `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Unbounded stream of every index event from now on, in emit order.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<IndexEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Limiter admitting this index's storage queries.
    pub fn limiter(&self) -> &TaskLimiter {
        &self.limiter
    }

    pub async fn list_directories(&self) -> Result<Vec<String>> {
        Ok(self
            .directories()
            .await?
            .iter()
            .map(|dir| dir.path.clone())
            .collect())
    }

    /// Registered directories in load order (ascending id).
    pub async fn directories(&self) -> Result<DirectoryList> {
        let cell = self.cache.current();
        let list = cell
            .get_or_try_init(|| async {
                let rows = self
                    .query(Statement::new("SELECT id, path, seq FROM directories ORDER BY id"))
                    .await?;
                let dirs = rows
                    .iter()
                    .map(Directory::from_row)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                debug!(count = dirs.len(), "loaded directories");
                Ok::<_, MonitorError>(Arc::new(dirs))
            })
            .await?;
        Ok(Arc::clone(list))
    }

    /// First registered directory whose path is a textual prefix of `path`.
    ///
    /// Overlapping roots resolve to whichever was registered first, not to the
    /// longest match.
    pub async fn find_owning_directory(&self, path: &str) -> Result<Option<Directory>> {
        Ok(self
            .directories()
            .await?
            .iter()
            .find(|dir| dir.owns(path))
            .cloned())
    }

    /// Register `path`, or return the directory that already owns it.
    pub async fn add_directory(&self, path: &str) -> Result<Directory> {
        let _writes = self.directory_writes.lock().await;
        if let Some(existing) = self.find_owning_directory(path).await? {
            debug!(path, owner = %existing.path, "directory already covered");
            return Ok(existing);
        }

        let rows = self
            .query(
                Statement::new("INSERT INTO directories (path) VALUES ($path) RETURNING id, path, seq")
                    .bind("path", path),
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| BackendError::query("INSERT into directories returned no row"))?;
        let directory = Directory::from_row(row)?;

        self.cache.invalidate();
        info!(path, id = directory.id, "directory added");
        self.emit(IndexEvent::DirAdded(path.to_string()));
        Ok(directory)
    }

    /// Remove the directory registered at exactly `path` together with its
    /// file records. Returns `false` if no such directory exists.
    ///
    /// Cascaded file records are dropped without `FileDeleted` events.
    pub async fn remove_directory(&self, path: &str) -> Result<bool> {
        let _writes = self.directory_writes.lock().await;
        let Some(directory) = self
            .directories()
            .await?
            .iter()
            .find(|dir| dir.path == path)
            .cloned()
        else {
            return Ok(false);
        };

        self.serialize(vec![
            Statement::new("DELETE FROM files WHERE directory_id = $id").bind("id", directory.id),
            Statement::new("DELETE FROM directories WHERE id = $id").bind("id", directory.id),
        ])
        .await?;

        self.cache.invalidate();
        info!(path, id = directory.id, "directory removed");
        self.emit(IndexEvent::DirDeleted(path.to_string()));
        Ok(true)
    }

    /// Whether `stat` differs from the stored state of `path`.
    ///
    /// Returns `false` for paths outside every registered directory. An
    /// existing record has its check time refreshed.
    pub async fn check_changed(&self, path: &str, stat: &FileStat) -> Result<bool> {
        let Some(directory) = self.find_owning_directory(path).await? else {
            return Ok(false);
        };
        let subpath = directory.subpath(path);

        let Some(record) = self.find_record(&directory, subpath).await? else {
            return Ok(true);
        };

        self.query(
            Statement::new("UPDATE files SET statdate = $statdate WHERE id = $id")
                .bind("statdate", Utc::now().timestamp_millis())
                .bind("id", record.id),
        )
        .await?;

        Ok(record.metadata_fingerprint != metadata_fingerprint(stat))
    }

    /// Store `stat` as the latest state of `path`, emitting `FileAdded` or
    /// `FileChanged` when the stored state moved.
    pub async fn record_observation(&self, path: &str, stat: &FileStat) -> Result<Observation> {
        let Some(directory) = self.find_owning_directory(path).await? else {
            return Ok(Observation::Unowned);
        };
        let subpath = directory.subpath(path);
        let stathash = metadata_fingerprint(stat);
        let statdate = Utc::now().timestamp_millis();

        match self.find_record(&directory, subpath).await? {
            Some(record) if record.metadata_fingerprint == stathash => Ok(Observation::Unchanged),
            Some(record) => {
                self.query(
                    Statement::new(
                        "UPDATE files SET stathash = $stathash, statdate = $statdate WHERE id = $id",
                    )
                    .bind("stathash", stathash.to_vec())
                    .bind("statdate", statdate)
                    .bind("id", record.id),
                )
                .await?;
                debug!(path, "file changed");
                self.emit(IndexEvent::FileChanged {
                    path: path.to_string(),
                    stat: *stat,
                });
                Ok(Observation::Changed)
            }
            None => {
                // Racing observers of the same new path converge on one row.
                self.query(
                    Statement::new(
                        "INSERT INTO files (directory_id, subpath, subpath_hash, statdate, stathash)
                         VALUES ($directory_id, $subpath, $subpath_hash, $statdate, $stathash)
                         ON CONFLICT(directory_id, subpath) DO UPDATE SET
                             subpath_hash = excluded.subpath_hash,
                             statdate = excluded.statdate,
                             stathash = excluded.stathash",
                    )
                    .bind("directory_id", directory.id)
                    .bind("subpath", subpath)
                    .bind("subpath_hash", subpath_fingerprint(subpath).to_vec())
                    .bind("statdate", statdate)
                    .bind("stathash", stathash.to_vec()),
                )
                .await?;
                debug!(path, "file added");
                self.emit(IndexEvent::FileAdded {
                    path: path.to_string(),
                    stat: *stat,
                });
                Ok(Observation::Added)
            }
        }
    }

    /// Forget `path`. Returns `true` and emits `FileDeleted` if a record was removed.
    pub async fn delete_record(&self, path: &str) -> Result<bool> {
        let Some(directory) = self.find_owning_directory(path).await? else {
            return Ok(false);
        };
        let rows = self
            .query(
                Statement::new(
                    "DELETE FROM files WHERE directory_id = $directory_id AND subpath = $subpath RETURNING id",
                )
                .bind("directory_id", directory.id)
                .bind("subpath", directory.subpath(path)),
            )
            .await?;

        if rows.is_empty() {
            return Ok(false);
        }
        debug!(path, "file deleted");
        self.emit(IndexEvent::FileDeleted(path.to_string()));
        Ok(true)
    }

    /// Stored record for `subpath` under `directory`.
    ///
    /// Candidates are pre-filtered by subpath hash and matched on the exact
    /// subpath so a hash collision never aliases two files.
    pub async fn find_record(
        &self,
        directory: &Directory,
        subpath: &str,
    ) -> Result<Option<FileRecord>> {
        let rows = self
            .query(
                Statement::new(
                    "SELECT id, directory_id, subpath, subpath_hash, statdate, stathash
                     FROM files
                     WHERE directory_id = $directory_id AND subpath_hash = $subpath_hash",
                )
                .bind("directory_id", directory.id)
                .bind("subpath_hash", subpath_fingerprint(subpath).to_vec()),
            )
            .await?;

        for row in &rows {
            let record = FileRecord::from_row(row)?;
            if record.subpath == subpath {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn emit(&self, event: IndexEvent) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn query(&self, statement: Statement) -> Result<Vec<DbRow>> {
        let backend = Arc::clone(&self.backend);
        let rows = self
            .limiter
            .submit(move || async move { backend.query(statement).await })
            .await??;
        Ok(rows)
    }

    async fn serialize(&self, statements: Vec<Statement>) -> Result<Vec<Vec<DbRow>>> {
        let backend = Arc::clone(&self.backend);
        let results = self
            .limiter
            .submit(move || async move { backend.serialize(statements).await })
            .await??;
        Ok(results)
    }
}
