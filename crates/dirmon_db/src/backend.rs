//! Storage backend abstraction layer.
//!
//! The fingerprint index only needs two things from storage: run one
//! statement with named parameters, and run several statements back to back
//! with exclusive access to the connection.

use crate::error::{BackendError, Result};
use crate::value::{DbRow, DbValue};
use async_trait::async_trait;

/// A SQL statement plus its named parameters.
///
/// Placeholders are written `$name` in the SQL and bound without the `$`:
///
/// ```rust
/// use dirmon_db::Statement;
///
/// let stmt = Statement::new("SELECT id FROM directories WHERE path = $path")
///     .bind("path", "/data");
/// assert_eq!(stmt.params().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<(String, DbValue)>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind a value to `$name`. Rebinding a name replaces the earlier value.
    pub fn bind(mut self, name: &str, value: impl Into<DbValue>) -> Self {
        let name = name.trim_start_matches('$');
        let value = value.into();
        match self.params.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[(String, DbValue)] {
        &self.params
    }

    /// Rewrite `$name` placeholders to positional `?N` ones.
    ///
    /// Returns the rewritten SQL and the values in positional order. A name
    /// used twice maps to the same position. Placeholders inside single-quoted
    /// literals are left alone.
    pub fn to_positional(&self) -> Result<(String, Vec<DbValue>)> {
        let mut sql = String::with_capacity(self.sql.len());
        let mut order: Vec<&str> = Vec::new();
        let mut values = Vec::new();
        let mut in_literal = false;
        let mut chars = self.sql.char_indices().peekable();

        while let Some((offset, ch)) = chars.next() {
            if ch == '\'' {
                in_literal = !in_literal;
                sql.push(ch);
                continue;
            }
            if ch != '$' || in_literal {
                sql.push(ch);
                continue;
            }

            let start = offset + 1;
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            if end == start {
                return Err(BackendError::query(format!(
                    "Bare '$' at offset {} in statement",
                    offset
                )));
            }

            let name = &self.sql[start..end];
            let position = match order.iter().position(|n| *n == name) {
                Some(pos) => pos,
                None => {
                    let value = self
                        .params
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| BackendError::MissingParameter(name.to_string()))?;
                    order.push(name);
                    values.push(value);
                    order.len() - 1
                }
            };
            sql.push('?');
            sql.push_str(&(position + 1).to_string());
        }

        Ok((sql, values))
    }
}

/// Async query interface the index is written against.
///
/// Implementations are expected to serialize statements on the underlying
/// connection; callers issue queries without additional locking.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Run one statement and return its rows (empty for writes).
    async fn query(&self, statement: Statement) -> Result<Vec<DbRow>>;

    /// Run statements in order with exclusive access to the connection,
    /// committing them as a unit. Returns one row set per statement.
    async fn serialize(&self, statements: Vec<Statement>) -> Result<Vec<Vec<DbRow>>>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
