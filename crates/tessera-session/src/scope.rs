//! Re-entrant unit-of-work scopes.
//!
//! Entering a scope binds a session to the current unit of work, or re-enters
//! the one already bound. Exiting with an [`Outcome`] only acts at the
//! outermost level: `Success` commits, `Failed` rolls back. A [`ScopeGuard`]
//! dropped without an exit (panic, cancelled future, early return) counts as
//! `Failed`, so the rollback and the connection release always happen.

use crate::context::{self, Attach, Leave};
use crate::error::{ScopeError, SessionError};
use crate::factory::SessionFactory;
use crate::outcome::{Decision, Outcome};
use crate::session::{Finished, Session};
use std::future::Future;
use tessera_db::PoolHandle;

/// Opens and closes scopes over sessions from one [`SessionFactory`].
#[derive(Debug, Clone)]
pub struct SessionManager {
    factory: SessionFactory,
}

impl SessionManager {
    pub fn new(factory: SessionFactory) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    pub fn pool(&self) -> &PoolHandle {
        self.factory.pool()
    }

    /// Enters a scope on the current thread, blocking while a connection is
    /// checked out.
    ///
    /// If the unit of work already has a session, it is returned with its
    /// depth incremented and no connection is checked out.
    ///
    /// # Errors
    ///
    /// `SessionError::NoUnitOfWork` outside [`context::unit_of_work`] /
    /// [`context::unit_of_work_blocking`], plus any error from
    /// [`SessionFactory::create`] or from `BEGIN`.
    pub fn enter(&self) -> Result<ScopeGuard, SessionError> {
        if let Some(guard) = Self::reenter()? {
            return Ok(guard);
        }
        let session = self.factory.open()?;
        Self::attach(session)
    }

    /// Async variant of [`enter`](Self::enter): the checkout and `BEGIN` run
    /// on the blocking thread pool.
    pub async fn enter_async(&self) -> Result<ScopeGuard, SessionError> {
        if let Some(guard) = Self::reenter()? {
            return Ok(guard);
        }
        let factory = self.factory.clone();
        let session = tokio::task::spawn_blocking(move || factory.open()).await??;
        Self::attach(session)
    }

    /// Runs `f` as (or inside) a unit of work with an active session.
    ///
    /// `Ok` commits and `Err` rolls back; the value or the original error is
    /// handed back. Dropping the returned future before it completes rolls the
    /// transaction back.
    pub async fn run<T, E, F, Fut>(&self, f: F) -> Result<T, ScopeError<E>>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        context::unit_of_work(async move {
            let guard = self.enter_async().await?;
            let result = f(guard.session().clone()).await;
            guard.complete_async(result).await
        })
        .await
    }

    /// Blocking counterpart of [`run`](Self::run) for plain threads.
    pub fn run_blocking<T, E, F>(&self, f: F) -> Result<T, ScopeError<E>>
    where
        F: FnOnce(&Session) -> Result<T, E>,
    {
        context::unit_of_work_blocking(|| {
            let guard = self.enter()?;
            let result = f(guard.session());
            guard.complete(result)
        })
    }

    fn reenter() -> Result<Option<ScopeGuard>, SessionError> {
        Ok(context::join()?.map(|(session, depth)| {
            tracing::trace!(session_id = %session.id(), depth, "re-entered scope");
            ScopeGuard::new(session)
        }))
    }

    fn attach(session: Session) -> Result<ScopeGuard, SessionError> {
        match context::attach(session.clone()) {
            Ok(Attach::Bound) => {
                tracing::debug!(session_id = %session.id(), "entered scope");
                Ok(ScopeGuard::new(session))
            }
            Ok(Attach::Joined(existing)) => {
                // Another enter on this unit of work won the race.
                discard(&session);
                Ok(ScopeGuard::new(existing))
            }
            Err(err) => {
                discard(&session);
                Err(err)
            }
        }
    }
}

fn discard(session: &Session) {
    if let Err(err) = session.finish(Decision::Rollback) {
        tracing::warn!(session_id = %session.id(), error = %err, "failed to discard session");
    }
}

/// One level of an entered scope.
///
/// Must be closed with [`exit`](Self::exit) (or one of its variants). Dropping
/// an un-exited guard is treated as a failed outcome.
#[must_use = "dropping a scope guard without exiting rolls the transaction back"]
#[derive(Debug)]
pub struct ScopeGuard {
    session: Session,
    armed: bool,
}

impl ScopeGuard {
    fn new(session: Session) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    /// The session held by this scope.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Leaves the scope. At the outermost level this commits on `Success` and
    /// rolls back on `Failed`; nested levels only decrement the depth.
    ///
    /// # Errors
    ///
    /// - `ScopeError::Failed(err)` for any `Failed(err)` whose rollback (if
    ///   any) succeeded; `err` is returned unchanged.
    /// - `ScopeError::RollbackFailed` when the rollback failed too.
    /// - `ScopeError::Commit` when `COMMIT` failed; the transaction was rolled
    ///   back.
    pub fn exit<E>(mut self, outcome: Outcome<E>) -> Result<(), ScopeError<E>> {
        let finished = self.close(outcome.decision());
        settle(outcome, finished)
    }

    /// Async variant of [`exit`](Self::exit); the commit or rollback runs on the
    /// blocking thread pool.
    pub async fn exit_async<E>(mut self, outcome: Outcome<E>) -> Result<(), ScopeError<E>> {
        let finished = self.close_async(outcome.decision()).await;
        settle(outcome, finished)
    }

    /// Exits with the outcome of `result` and hands its value or error back.
    pub fn complete<T, E>(mut self, result: Result<T, E>) -> Result<T, ScopeError<E>> {
        let finished = self.close(Decision::from(&result));
        conclude(result, finished)
    }

    /// Async variant of [`complete`](Self::complete).
    pub async fn complete_async<T, E>(mut self, result: Result<T, E>) -> Result<T, ScopeError<E>> {
        let finished = self.close_async(Decision::from(&result)).await;
        conclude(result, finished)
    }

    /// Leaves this level and, if it was the last one, finishes the session.
    /// `None` means an outer scope still holds the session.
    fn close(&mut self, decision: Decision) -> Option<Result<Finished, SessionError>> {
        self.armed = false;
        self.leave()
            .then(|| self.session.finish(decision))
    }

    async fn close_async(&mut self, decision: Decision) -> Option<Result<Finished, SessionError>> {
        self.armed = false;
        if !self.leave() {
            return None;
        }
        let session = self.session.clone();
        // The blocking task runs to completion even if this future is dropped.
        let finished = tokio::task::spawn_blocking(move || session.finish(decision))
            .await
            .map_err(SessionError::from)
            .and_then(|result| result);
        Some(finished)
    }

    /// Returns whether this was the last level holding the session.
    fn leave(&self) -> bool {
        match context::leave(&self.session) {
            Leave::Nested(depth) => {
                tracing::trace!(session_id = %self.session.id(), depth, "left nested scope");
                false
            }
            Leave::Last | Leave::Detached => true,
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if !self.leave() {
            tracing::warn!(
                session_id = %self.session.id(),
                "nested scope dropped without exit"
            );
            return;
        }
        tracing::warn!(
            session_id = %self.session.id(),
            "scope dropped without exit, rolling back"
        );
        if let Err(err) = self.session.finish(Decision::Rollback) {
            tracing::error!(
                session_id = %self.session.id(),
                error = %err,
                "rollback of abandoned scope failed"
            );
        }
    }
}

fn settle<E>(
    outcome: Outcome<E>,
    finished: Option<Result<Finished, SessionError>>,
) -> Result<(), ScopeError<E>> {
    match outcome {
        Outcome::Success => settle_success(finished),
        Outcome::Failed(original) => Err(settle_failure(original, finished)),
    }
}

fn conclude<T, E>(
    result: Result<T, E>,
    finished: Option<Result<Finished, SessionError>>,
) -> Result<T, ScopeError<E>> {
    match result {
        Ok(value) => settle_success(finished).map(|()| value),
        Err(original) => Err(settle_failure(original, finished)),
    }
}

fn settle_success<E>(finished: Option<Result<Finished, SessionError>>) -> Result<(), ScopeError<E>> {
    match finished {
        None | Some(Ok(_)) => Ok(()),
        Some(Err(SessionError::Commit(err))) => Err(ScopeError::Commit(err)),
        Some(Err(err)) => Err(ScopeError::Session(err)),
    }
}

fn settle_failure<E>(original: E, finished: Option<Result<Finished, SessionError>>) -> ScopeError<E> {
    match finished {
        None | Some(Ok(_)) => ScopeError::Failed(original),
        Some(Err(rollback)) => ScopeError::RollbackFailed { original, rollback },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DoubleExitWarning;
    use crate::session::TxState;
    use std::error::Error as _;
    use uuid::Uuid;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("domain rule violated")]
    struct DomainError;

    fn rollback_error() -> SessionError {
        SessionError::Rollback(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
            Some("disk I/O error".to_string()),
        ))
    }

    #[test]
    fn success_without_errors_is_ok() {
        assert!(settle::<DomainError>(Outcome::Success, Some(Ok(Finished::Committed))).is_ok());
        assert!(settle::<DomainError>(Outcome::Success, None).is_ok());
    }

    #[test]
    fn double_exit_is_not_an_error() {
        let warning = DoubleExitWarning {
            session_id: Uuid::new_v4(),
            state: TxState::Committed,
        };
        let finished = Some(Ok(Finished::AlreadyTerminal(warning)));
        assert!(settle::<DomainError>(Outcome::Success, finished).is_ok());
    }

    #[test]
    fn failure_is_returned_unchanged() {
        let err = settle(Outcome::Failed(DomainError), Some(Ok(Finished::RolledBack))).unwrap_err();
        assert!(matches!(err, ScopeError::Failed(DomainError)));
        assert_eq!(err.to_string(), "domain rule violated");
    }

    #[test]
    fn nested_failure_is_returned_unchanged() {
        let err = settle(Outcome::Failed(DomainError), None).unwrap_err();
        assert_eq!(err.into_original().unwrap(), DomainError);
    }

    #[test]
    fn rollback_failure_keeps_original_as_source() {
        let err = settle(Outcome::Failed(DomainError), Some(Err(rollback_error()))).unwrap_err();

        assert_eq!(err.original(), Some(&DomainError));
        let source = err.source().expect("original error should be the source");
        assert_eq!(source.to_string(), "domain rule violated");
        let message = err.to_string();
        assert!(message.contains("failed to roll back"), "{message}");
        assert!(message.contains("domain rule violated"), "{message}");
    }

    #[test]
    fn commit_failure_is_surfaced() {
        let commit = crate::error::CommitError {
            source: rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                Some("FOREIGN KEY constraint failed".to_string()),
            ),
            rollback: None,
        };
        let err = settle::<DomainError>(Outcome::Success, Some(Err(commit.into()))).unwrap_err();
        assert!(matches!(err, ScopeError::Commit(_)));
        assert!(err.original().is_none());
    }

    #[test]
    fn conclude_hands_back_value() {
        let ok: Result<u32, DomainError> = Ok(5);
        assert_eq!(conclude(ok, Some(Ok(Finished::Committed))).unwrap(), 5);
    }
}
