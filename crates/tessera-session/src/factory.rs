//! Session creation from the shared pool.

use crate::error::SessionError;
use crate::session::Session;
use serde::Deserialize;
use std::time::Instant;
use tessera_db::PoolHandle;

/// Locking behavior of the `BEGIN` statement that opens each session's
/// transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeginMode {
    /// Take locks lazily, on first read or write.
    #[default]
    Deferred,
    /// Take the write lock up front.
    Immediate,
    /// Take an exclusive lock up front.
    Exclusive,
}

impl BeginMode {
    /// The SQL statement for this mode.
    pub fn sql(self) -> &'static str {
        match self {
            BeginMode::Deferred => "BEGIN DEFERRED",
            BeginMode::Immediate => "BEGIN IMMEDIATE",
            BeginMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Session-level tunables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// How each session's transaction is opened.
    pub begin: BeginMode,
}

/// Produces sessions bound to connections checked out of one pool.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    pool: PoolHandle,
    options: SessionOptions,
}

impl SessionFactory {
    pub fn new(pool: PoolHandle, options: SessionOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Checks out one connection and wraps it in a session in state
    /// [`TxState::None`](crate::TxState::None).
    ///
    /// Blocks for at most the pool's acquire timeout. A connection that comes
    /// back from the pool still inside a transaction is rolled back first.
    ///
    /// # Errors
    ///
    /// `SessionError::PoolExhausted` when no connection became available,
    /// `SessionError::PoolClosed` after shutdown, and
    /// `SessionError::Rollback` if a stale transaction cannot be cleared.
    pub fn create(&self) -> Result<Session, SessionError> {
        let started = Instant::now();
        let conn = self.pool.acquire()?;

        if !conn.is_autocommit() {
            tracing::warn!("pooled connection returned mid-transaction, rolling back");
            conn.execute_batch("ROLLBACK")
                .map_err(SessionError::Rollback)?;
        }

        let session = Session::new(conn);
        tracing::debug!(
            session_id = %session.id(),
            waited_ms = started.elapsed().as_millis() as u64,
            "created session"
        );
        Ok(session)
    }

    /// Like [`create`](Self::create), but waits for the connection on the
    /// blocking thread pool so the calling task is suspended instead.
    pub async fn create_async(&self) -> Result<Session, SessionError> {
        let factory = self.clone();
        tokio::task::spawn_blocking(move || factory.create()).await?
    }

    /// Creates a session and opens its transaction.
    pub(crate) fn open(&self) -> Result<Session, SessionError> {
        let session = self.create()?;
        session.begin(self.options.begin)?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TxState;
    use std::time::Duration;
    use tessera_db::{AcquirePolicy, PoolOptions};

    fn pool(dir: &tempfile::TempDir, options: PoolOptions) -> PoolHandle {
        let path = dir.path().join("factory.db");
        PoolHandle::open(path.to_str().unwrap(), options).unwrap()
    }

    #[test]
    fn create_returns_session_without_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SessionFactory::new(pool(&dir, PoolOptions::default()), SessionOptions::default());

        let session = factory.create().unwrap();
        assert_eq!(session.state(), TxState::None);
        assert_eq!(factory.pool().status().checked_out, 1);
    }

    #[test]
    fn open_begins_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SessionFactory::new(
            pool(&dir, PoolOptions::default()),
            SessionOptions {
                begin: BeginMode::Immediate,
            },
        );

        let session = factory.open().unwrap();
        assert_eq!(session.state(), TxState::Active);
    }

    #[test]
    fn create_fails_when_pool_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let options = PoolOptions {
            max_size: 1,
            acquire: AcquirePolicy::Wait {
                timeout: Duration::from_millis(50),
            },
            ..PoolOptions::default()
        };
        let factory = SessionFactory::new(pool(&dir, options), SessionOptions::default());

        let _held = factory.create().unwrap();
        let err = factory.create().unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }

    #[test]
    fn create_fails_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SessionFactory::new(pool(&dir, PoolOptions::default()), SessionOptions::default());
        factory.pool().close().unwrap();

        assert!(matches!(factory.create(), Err(SessionError::PoolClosed)));
    }

    #[test]
    fn stale_transaction_is_cleared_on_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let options = PoolOptions {
            max_size: 1,
            ..PoolOptions::default()
        };
        let factory = SessionFactory::new(pool(&dir, options), SessionOptions::default());

        {
            let conn = factory.pool().acquire().unwrap();
            conn.execute_batch("BEGIN").unwrap();
        }

        let session = factory.open().expect("stale transaction should be rolled back");
        assert_eq!(session.state(), TxState::Active);
    }
}
