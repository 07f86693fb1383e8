//! SQLite implementation of [`StorageBackend`] on top of sqlx.

use crate::backend::{Statement, StorageBackend};
use crate::error::{BackendError, Result};
use crate::value::{DbRow, DbValue};
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use std::path::Path;
use tracing::{info, trace};

/// SQLite-backed storage.
///
/// The pool holds a single connection, so every statement issued through
/// this backend executes one at a time.
#[derive(Clone, Debug)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open or create a database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&pool)
            .await?;

        info!(path = %path.display(), "Database opened");
        Ok(Self { pool })
    }

    /// Open a private in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self> {
        // The database lives only as long as its connection, so never let
        // the pool recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        info!("Opened in-memory database");
        Ok(Self { pool })
    }

    /// Underlying pool (escape hatch for tests and diagnostics).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn query(&self, statement: Statement) -> Result<Vec<DbRow>> {
        fetch_rows(&self.pool, &statement).await
    }

    async fn serialize(&self, statements: Vec<Statement>) -> Result<Vec<Vec<DbRow>>> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in &statements {
            results.push(fetch_rows(&mut *tx, statement).await?);
        }
        tx.commit().await?;
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "SQLite"
    }
}

async fn fetch_rows<'c, E>(executor: E, statement: &Statement) -> Result<Vec<DbRow>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let (sql, values) = statement.to_positional()?;
    trace!(sql = %sql, params = values.len(), "SQL");

    let mut query = sqlx::query(&sql);
    for value in values {
        query = bind_value(query, value);
    }

    let rows = query.fetch_all(executor).await?;
    rows.iter().map(convert_row).collect()
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: DbValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        DbValue::Null => query.bind(None::<i64>),
        DbValue::Integer(v) => query.bind(v),
        DbValue::Real(v) => query.bind(v),
        DbValue::Text(v) => query.bind(v),
        DbValue::Blob(v) => query.bind(v),
    }
}

fn convert_row(row: &SqliteRow) -> Result<DbRow> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    for (index, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());

        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            values.push(DbValue::Null);
            continue;
        }

        // The value's storage class, not the declared column type, decides
        // how it is read back.
        let type_name = raw.type_info().name().to_ascii_uppercase();
        let value = match type_name.as_str() {
            "INTEGER" | "INT" | "INT4" | "INT8" | "BIGINT" | "BOOLEAN" => {
                DbValue::Integer(row.try_get_unchecked::<i64, _>(index)?)
            }
            "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                DbValue::Real(row.try_get_unchecked::<f64, _>(index)?)
            }
            "BLOB" => DbValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(index)?),
            "TEXT" | "DATE" | "TIME" | "DATETIME" => {
                DbValue::Text(row.try_get_unchecked::<String, _>(index)?)
            }
            other => {
                return Err(BackendError::type_conversion(format!(
                    "Unsupported column type {} for '{}'",
                    other,
                    column.name()
                )))
            }
        };
        values.push(value);
    }

    Ok(DbRow::new(columns, values))
}
