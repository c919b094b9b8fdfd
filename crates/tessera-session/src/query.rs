//! Result-shape helpers over a session connection.
//!
//! ```ignore
//! let title = session.with_connection(|conn| {
//!     Query::new(conn).one("SELECT title FROM notes WHERE id = ?1", [id], |row| row.get(0))
//! })?;
//! ```

use crate::error::SessionError;
use rusqlite::{Connection, Params, Row};
use thiserror::Error;

/// Default number of rows per batch for [`Query::batches`].
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Errors returned by [`Query`] helpers.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Exactly one row was expected, none came back.
    #[error("query returned no rows")]
    NoResult,

    /// At most one row was expected, several came back.
    #[error("query returned more than one row")]
    MultipleResults,

    /// The session could not run the query.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// SQLite rejected the statement.
    #[error("query failed: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Borrowing query helper over one connection.
#[derive(Debug, Clone, Copy)]
pub struct Query<'c> {
    conn: &'c Connection,
}

impl<'c> Query<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Exactly one row.
    ///
    /// # Errors
    ///
    /// `QueryError::NoResult` for zero rows, `QueryError::MultipleResults` for
    /// more than one.
    pub fn one<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<T, QueryError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.one_or_none(sql, params, map)?
            .ok_or(QueryError::NoResult)
    }

    /// Zero or one row.
    ///
    /// # Errors
    ///
    /// `QueryError::MultipleResults` if more than one row comes back.
    pub fn one_or_none<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Option<T>, QueryError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query_map(params, map)?;
        let first = match rows.next() {
            Some(row) => row?,
            None => return Ok(None),
        };
        if rows.next().is_some() {
            return Err(QueryError::MultipleResults);
        }
        Ok(Some(first))
    }

    /// Exactly one row, or the caller's `error` when there is none.
    pub fn one_or_raise<T, P, F, Er>(&self, sql: &str, params: P, map: F, error: Er) -> Result<T, Er>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
        Er: From<QueryError>,
    {
        self.one_or_none(sql, params, map)?.ok_or(error)
    }

    /// Exactly one row, or `default` when there is none.
    pub fn one_or_default<T, P, F>(&self, sql: &str, params: P, map: F, default: T) -> Result<T, QueryError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.one_or_none(sql, params, map)?.unwrap_or(default))
    }

    /// Every row.
    pub fn all<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>, QueryError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Streams rows to `each` in batches of at most `batch_size` (minimum 1)
    /// without materializing the full result. Returns the number of rows.
    pub fn batches<T, P, F, B>(
        &self,
        sql: &str,
        params: P,
        batch_size: usize,
        map: F,
        mut each: B,
    ) -> Result<usize, QueryError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
        B: FnMut(Vec<T>) -> Result<(), QueryError>,
    {
        let batch_size = batch_size.max(1);
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?;

        let mut total = 0;
        let mut batch = Vec::with_capacity(batch_size);
        for row in rows {
            batch.push(row?);
            if batch.len() == batch_size {
                total += batch.len();
                each(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)))?;
            }
        }
        if !batch.is_empty() {
            total += batch.len();
            each(batch)?;
        }
        Ok(total)
    }

    /// Whether `sql` returns at least one row.
    pub fn exists<P: Params>(&self, sql: &str, params: P) -> Result<bool, QueryError> {
        let wrapped = format!("SELECT EXISTS ({})", strip_terminator(sql));
        Ok(self.conn.query_row(&wrapped, params, |row| row.get(0))?)
    }

    /// Number of rows `sql` returns.
    pub fn count<P: Params>(&self, sql: &str, params: P) -> Result<u64, QueryError> {
        let wrapped = format!("SELECT COUNT(*) FROM ({})", strip_terminator(sql));
        let count: i64 = self.conn.query_row(&wrapped, params, |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// `(value, label)` pairs for every row, e.g. to fill a select box.
    pub fn choices<T, P, F, V, L, GV, GL>(
        &self,
        sql: &str,
        params: P,
        map: F,
        value: GV,
        label: GL,
    ) -> Result<Vec<(V, L)>, QueryError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
        GV: Fn(&T) -> V,
        GL: Fn(&T) -> L,
    {
        Ok(self
            .all(sql, params, map)?
            .iter()
            .map(|item| (value(item), label(item)))
            .collect())
    }
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';')
}
