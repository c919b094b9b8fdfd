//! Error types for session lifecycle operations.

use crate::session::TxState;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use tessera_db::{AcquireError, ConnectionError};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while opening, using or finishing a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The pool could not be opened or is misconfigured.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// No pooled connection became available in time. Transient: the whole
    /// unit of work may be retried.
    #[error("no pooled connection became available within {waited:?} (pool max size {max_size})")]
    PoolExhausted {
        /// How long the checkout waited.
        waited: Duration,
        /// The configured pool size.
        max_size: u32,
    },

    /// The pool was closed for shutdown.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A connection could not be checked out for another reason.
    #[error("failed to check out a connection: {0}")]
    Checkout(#[source] AcquireError),

    /// `current()` was called outside of any scope.
    #[error("no active session is bound to the current unit of work")]
    NoActiveSession,

    /// A scope was entered outside of a unit of work.
    #[error("not running inside a unit of work")]
    NoUnitOfWork,

    /// A different session is already bound to this unit of work.
    #[error("a different session is already bound to this unit of work")]
    AlreadyBound,

    /// The session has no open transaction to work in.
    #[error("session {id} is {state}, not active")]
    NotActive {
        /// The session identifier.
        id: Uuid,
        /// Its transaction state at the time of the call.
        state: TxState,
    },

    /// `BEGIN` failed.
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] rusqlite::Error),

    /// `COMMIT` failed; a rollback was attempted.
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// `ROLLBACK` failed.
    #[error("failed to roll back transaction: {0}")]
    Rollback(#[source] rusqlite::Error),

    /// A statement issued through the session failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The blocking task running database work panicked or was cancelled.
    #[error("blocking database task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl SessionError {
    /// Whether retrying the whole unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::PoolExhausted { .. })
    }
}

impl From<AcquireError> for SessionError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Exhausted { waited, max_size } => {
                SessionError::PoolExhausted { waited, max_size }
            }
            AcquireError::Closed => SessionError::PoolClosed,
            other => SessionError::Checkout(other),
        }
    }
}

/// The transaction could not be committed. A rollback is always attempted
/// afterwards; its failure, if any, is kept in `rollback`.
#[derive(Debug, Error)]
#[error(
    "failed to commit transaction: {source}{}",
    .rollback.as_ref().map(|e| format!(" (rollback also failed: {e})")).unwrap_or_default()
)]
pub struct CommitError {
    /// Why `COMMIT` failed.
    #[source]
    pub source: rusqlite::Error,
    /// Why the follow-up `ROLLBACK` failed, if it did.
    pub rollback: Option<rusqlite::Error>,
}

/// Non-fatal diagnostic: a session that already reached a terminal state was
/// asked to finish again. Nothing is committed or rolled back a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session {session_id} exited again after reaching state '{state}'")]
pub struct DoubleExitWarning {
    /// The session that was exited twice.
    pub session_id: Uuid,
    /// The state it had already reached.
    pub state: TxState,
}

/// Failure of a unit of work, as seen by the code that opened the scope.
///
/// The error the unit of work itself produced is never replaced: it is either
/// returned as is (`Failed`) or carried next to the rollback failure
/// (`RollbackFailed`) and reported as that error's source.
#[derive(Debug)]
pub enum ScopeError<E> {
    /// The scope could not be opened or closed.
    Session(SessionError),
    /// The unit of work failed and its transaction was rolled back.
    Failed(E),
    /// The unit of work succeeded but its transaction could not be committed.
    Commit(CommitError),
    /// The unit of work failed and rolling back failed as well.
    RollbackFailed {
        /// The error produced by the unit of work.
        original: E,
        /// The rollback failure.
        rollback: SessionError,
    },
}

impl<E> ScopeError<E> {
    /// The error produced by the unit of work, if this is one.
    pub fn original(&self) -> Option<&E> {
        match self {
            ScopeError::Failed(original) | ScopeError::RollbackFailed { original, .. } => {
                Some(original)
            }
            ScopeError::Session(_) | ScopeError::Commit(_) => None,
        }
    }

    /// Unwraps the error produced by the unit of work, handing back `self`
    /// when the failure came from the scope itself.
    pub fn into_original(self) -> Result<E, Self> {
        match self {
            ScopeError::Failed(original) | ScopeError::RollbackFailed { original, .. } => {
                Ok(original)
            }
            other => Err(other),
        }
    }
}

impl<E> From<SessionError> for ScopeError<E> {
    fn from(err: SessionError) -> Self {
        ScopeError::Session(err)
    }
}

impl<E: fmt::Display> fmt::Display for ScopeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeError::Session(err) => write!(f, "{err}"),
            ScopeError::Failed(original) => write!(f, "{original}"),
            ScopeError::Commit(err) => write!(f, "{err}"),
            ScopeError::RollbackFailed { original, rollback } => {
                write!(f, "{rollback} after unit of work failed: {original}")
            }
        }
    }
}

impl<E> StdError for ScopeError<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ScopeError::Session(err) => err.source(),
            ScopeError::Failed(original) => original.source(),
            ScopeError::Commit(err) => err.source(),
            ScopeError::RollbackFailed { original, .. } => Some(original),
        }
    }
}
