//! Error types for pool creation, checkout and shutdown.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when opening the connection pool.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The DSN is empty or otherwise unusable.
    #[error("invalid database DSN: {0}")]
    InvalidDsn(String),

    /// The pool options are inconsistent.
    #[error("invalid pool options: {0}")]
    InvalidOptions(String),

    /// The database could not be opened.
    #[error("database '{dsn}' is unreachable: {source}")]
    Unreachable {
        /// The DSN that was being opened.
        dsn: String,
        /// The underlying pool error.
        source: r2d2::Error,
    },
}

/// Errors that can occur when checking a connection out of the pool.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Every connection stayed checked out for the whole wait.
    #[error("no pooled connection became available within {waited:?} (max size {max_size})")]
    Exhausted {
        /// How long the caller waited before giving up.
        waited: Duration,
        /// The configured pool size.
        max_size: u32,
    },

    /// The pool has been closed for shutdown.
    #[error("connection pool is closed")]
    Closed,

    /// A new connection could not be established.
    #[error("failed to open a database connection: {0}")]
    Connection(#[from] r2d2::Error),
}

/// Returned by [`crate::PoolHandle::close`] when sessions outlive the drain
/// timeout.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection pool closed with {open_sessions} session(s) still open")]
pub struct ShutdownError {
    /// Number of connections still checked out when the drain timed out.
    pub open_sessions: usize,
}
