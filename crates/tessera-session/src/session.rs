//! A logical database session: one pooled connection plus its transaction.

use crate::error::{CommitError, DoubleExitWarning, SessionError};
use crate::factory::BeginMode;
use crate::outcome::Decision;
use rusqlite::{Connection, Params};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tessera_db::PooledConnection;
use uuid::Uuid;

/// Transaction state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    /// Created, no transaction begun yet.
    None,
    /// Inside an open transaction.
    Active,
    /// Committed; the connection has been released.
    Committed,
    /// Rolled back; the connection has been released.
    RolledBack,
}

impl TxState {
    /// Whether the session has reached `Committed` or `RolledBack`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }

    /// Lowercase name used in logs and messages.
    pub fn as_str(self) -> &'static str {
        match self {
            TxState::None => "none",
            TxState::Active => "active",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled-back",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`Session::finish`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finished {
    /// The transaction was committed.
    Committed,
    /// The transaction was rolled back.
    RolledBack,
    /// No transaction had begun; the connection was simply released.
    Released,
    /// The session was already finished; nothing happened.
    AlreadyTerminal(DoubleExitWarning),
}

struct Core {
    conn: Option<PooledConnection>,
    state: TxState,
}

struct Inner {
    id: Uuid,
    core: Mutex<Core>,
}

impl Drop for Inner {
    // Last handle gone without `finish`, e.g. a session opened for a unit of
    // work that was cancelled while waiting for it. The transaction must not
    // reach the pool still open.
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(conn) = core.conn.take() else {
            return;
        };
        if core.state != TxState::Active {
            return;
        }
        core.state = TxState::RolledBack;
        tracing::warn!(
            session_id = %self.id,
            "session dropped with open transaction, rolling back"
        );
        if let Err(err) = rollback(&conn) {
            tracing::error!(
                session_id = %self.id,
                error = %err,
                "rollback of dropped session failed"
            );
        }
    }
}

/// Handle to one logical unit of database work bound to one checked-out
/// connection.
///
/// Clones share the same underlying session. Statements issued through any
/// clone are serialized on the single connection in call order.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(conn: PooledConnection) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                core: Mutex::new(Core {
                    conn: Some(conn),
                    state: TxState::None,
                }),
            }),
        }
    }

    /// Unique identifier of this session.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current transaction state.
    pub fn state(&self) -> TxState {
        self.lock().state
    }

    /// Whether both handles refer to the same session.
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `f` against the session's connection inside its open transaction.
    ///
    /// The connection is locked for the duration of `f`; calling back into the
    /// same session from inside `f` deadlocks.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotActive` (converted into `Er`) when the session
    /// has no open transaction, otherwise whatever `f` returns.
    pub fn with_connection<R, Er, F>(&self, f: F) -> Result<R, Er>
    where
        F: FnOnce(&Connection) -> Result<R, Er>,
        Er: From<SessionError>,
    {
        let core = self.lock();
        match (&core.conn, core.state) {
            (Some(conn), TxState::Active) => f(conn),
            (_, state) => Err(SessionError::NotActive {
                id: self.id(),
                state,
            }
            .into()),
        }
    }

    /// Executes one statement and returns the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotActive` or `SessionError::Database`.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, SessionError> {
        self.with_connection(|conn| Ok(conn.execute(sql, params)?))
    }

    /// Async variant of [`with_connection`](Self::with_connection): runs `f` on
    /// the blocking thread pool so the calling task is suspended, not blocked.
    ///
    /// # Errors
    ///
    /// Same as `with_connection`, plus `SessionError::Blocking` if the blocking
    /// task panics.
    pub async fn run<R, Er, F>(&self, f: F) -> Result<R, Er>
    where
        F: FnOnce(&Connection) -> Result<R, Er> + Send + 'static,
        R: Send + 'static,
        Er: From<SessionError> + Send + 'static,
    {
        let session = self.clone();
        tokio::task::spawn_blocking(move || session.with_connection(f))
            .await
            .map_err(|e| Er::from(SessionError::Blocking(e)))?
    }

    /// Opens the transaction: `None` -> `Active`.
    pub(crate) fn begin(&self, mode: BeginMode) -> Result<(), SessionError> {
        let mut core = self.lock();
        if core.state != TxState::None {
            return Err(SessionError::NotActive {
                id: self.id(),
                state: core.state,
            });
        }
        let conn = core.conn.as_ref().ok_or(SessionError::NotActive {
            id: self.id(),
            state: core.state,
        })?;
        conn.execute_batch(mode.sql()).map_err(SessionError::Begin)?;
        core.state = TxState::Active;
        tracing::debug!(session_id = %self.id(), mode = mode.sql(), "began transaction");
        Ok(())
    }

    /// Applies the terminal decision and returns the connection to the pool.
    ///
    /// The connection is released exactly once, after the decision, on every
    /// path out of this function including a failed commit or rollback. A
    /// failed commit is always followed by a rollback attempt. Calling this on
    /// a finished session is a no-op reported as
    /// [`Finished::AlreadyTerminal`].
    pub(crate) fn finish(&self, decision: Decision) -> Result<Finished, SessionError> {
        let mut core = self.lock();
        let state = core.state;

        let Some(conn) = core.conn.take() else {
            let warning = DoubleExitWarning {
                session_id: self.id(),
                state,
            };
            tracing::warn!(
                session_id = %self.id(),
                state = %state,
                "{warning}; ignoring"
            );
            return Ok(Finished::AlreadyTerminal(warning));
        };

        if state == TxState::None {
            tracing::debug!(session_id = %self.id(), "released session without transaction");
            return Ok(Finished::Released);
        }

        match decision {
            Decision::Commit => match conn.execute_batch("COMMIT") {
                Ok(()) => {
                    core.state = TxState::Committed;
                    tracing::debug!(session_id = %self.id(), "committed transaction");
                    Ok(Finished::Committed)
                }
                Err(source) => {
                    let rollback = rollback(&conn).err();
                    core.state = TxState::RolledBack;
                    tracing::warn!(
                        session_id = %self.id(),
                        error = %source,
                        rollback_failed = rollback.is_some(),
                        "commit failed, rolled back"
                    );
                    Err(CommitError { source, rollback }.into())
                }
            },
            Decision::Rollback => {
                core.state = TxState::RolledBack;
                match rollback(&conn) {
                    Ok(()) => {
                        tracing::debug!(session_id = %self.id(), "rolled back transaction");
                        Ok(Finished::RolledBack)
                    }
                    Err(e) => {
                        tracing::error!(session_id = %self.id(), error = %e, "rollback failed");
                        Err(SessionError::Rollback(e))
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rolls back the open transaction, if SQLite still has one.
fn rollback(conn: &Connection) -> rusqlite::Result<()> {
    if conn.is_autocommit() {
        return Ok(());
    }
    conn.execute_batch("ROLLBACK")
}
