//! Storage layer for dirmon
//!
//! The fingerprint index talks to storage only through [`StorageBackend`]:
//! one async `query` with `$name` parameters, and `serialize` for
//! multi-statement operations that need exclusive access.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dirmon_db::{SqliteBackend, Statement, StorageBackend};
//!
//! let db = SqliteBackend::open("~/.dirmon/dirmon.sqlite3").await?;
//! let rows = db
//!     .query(Statement::new("SELECT id FROM directories WHERE path = $path").bind("path", "/data"))
//!     .await?;
//! ```

mod backend;
mod error;
#[cfg(feature = "sqlite")]
mod sqlite;
mod value;

pub use backend::{Statement, StorageBackend};
pub use error::{BackendError, Result};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use value::{DbRow, DbValue, FromDbValue};

