//! Binding of the active session to the current unit of work.
//!
//! Each unit of work owns one slot. Async units get it from a
//! `tokio::task_local!` scoped around their future, threads from
//! `sync_scope` around a closure. The slot is never shared: a task spawned
//! from inside a unit of work starts without one, and concurrent units never
//! see each other's binding. Only the owning task touches its slot, so no lock
//! is involved.

use crate::error::SessionError;
use crate::session::Session;
use std::cell::RefCell;
use std::future::Future;

tokio::task_local! {
    static SLOT: RefCell<Option<Binding>>;
}

struct Binding {
    session: Session,
    depth: usize,
}

/// Result of leaving one level of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Leave {
    /// Outer scopes still hold the session; `depth` levels remain.
    Nested(usize),
    /// This was the outermost level; the session is now unbound.
    Last,
    /// The session was not bound here (already unbound, or no slot).
    Detached,
}

/// Result of attaching a freshly created session.
pub(crate) enum Attach {
    /// The session is now bound at depth 1.
    Bound,
    /// Another session got bound first; it was joined instead.
    Joined(Session),
}

/// Runs `future` as a unit of work with its own session slot.
///
/// If the caller is already inside a unit of work, the existing slot is used,
/// so nested calls share one session.
pub async fn unit_of_work<F>(future: F) -> F::Output
where
    F: Future,
{
    if in_unit_of_work() {
        future.await
    } else {
        SLOT.scope(RefCell::new(None), future).await
    }
}

/// Runs `f` as a unit of work on the current thread. Nested calls reuse the
/// outer slot.
pub fn unit_of_work_blocking<R, F>(f: F) -> R
where
    F: FnOnce() -> R,
{
    if in_unit_of_work() {
        f()
    } else {
        SLOT.sync_scope(RefCell::new(None), f)
    }
}

/// Whether the caller is running inside a unit of work.
pub fn in_unit_of_work() -> bool {
    SLOT.try_with(|_| ()).is_ok()
}

/// The session bound to the current unit of work.
///
/// # Errors
///
/// Returns `SessionError::NoActiveSession` outside of any scope. A session is
/// never created on demand here.
pub fn current() -> Result<Session, SessionError> {
    SLOT.try_with(|slot| slot.borrow().as_ref().map(|b| b.session.clone()))
        .ok()
        .flatten()
        .ok_or(SessionError::NoActiveSession)
}

/// Binds `session` to the current unit of work at depth 1. Binding the session
/// that is already bound is a no-op.
///
/// # Errors
///
/// `SessionError::NoUnitOfWork` outside a unit of work and
/// `SessionError::AlreadyBound` when a different session is bound.
pub fn bind(session: Session) -> Result<(), SessionError> {
    with_slot(|slot| match slot {
        Some(existing) if existing.session.ptr_eq(&session) => Ok(()),
        Some(_) => Err(SessionError::AlreadyBound),
        None => {
            *slot = Some(Binding { session, depth: 1 });
            Ok(())
        }
    })?
}

/// Removes the current binding regardless of its depth and returns the session.
/// The session itself is left untouched.
pub fn unbind() -> Option<Session> {
    SLOT.try_with(|slot| slot.borrow_mut().take().map(|b| b.session))
        .ok()
        .flatten()
}

/// How many scopes currently hold the bound session (0 when unbound).
pub fn depth() -> usize {
    SLOT.try_with(|slot| slot.borrow().as_ref().map_or(0, |b| b.depth))
        .unwrap_or(0)
}

/// Re-enters the bound session, if there is one.
pub(crate) fn join() -> Result<Option<(Session, usize)>, SessionError> {
    with_slot(|slot| {
        slot.as_mut().map(|binding| {
            binding.depth += 1;
            (binding.session.clone(), binding.depth)
        })
    })
}

/// Binds a session created for this unit of work. If another one was bound in
/// the meantime, that one is joined instead and the caller must discard its
/// own.
pub(crate) fn attach(session: Session) -> Result<Attach, SessionError> {
    with_slot(|slot| match slot {
        Some(binding) => {
            binding.depth += 1;
            Attach::Joined(binding.session.clone())
        }
        None => {
            *slot = Some(Binding { session, depth: 1 });
            Attach::Bound
        }
    })
}

/// Leaves one level of the scope holding `session`.
pub(crate) fn leave(session: &Session) -> Leave {
    SLOT.try_with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(binding) if binding.session.ptr_eq(session) => {
                binding.depth = binding.depth.saturating_sub(1);
                if binding.depth == 0 {
                    *slot = None;
                    Leave::Last
                } else {
                    Leave::Nested(binding.depth)
                }
            }
            _ => Leave::Detached,
        }
    })
    .unwrap_or(Leave::Detached)
}

fn with_slot<R>(f: impl FnOnce(&mut Option<Binding>) -> R) -> Result<R, SessionError> {
    SLOT.try_with(|slot| f(&mut slot.borrow_mut()))
        .map_err(|_| SessionError::NoUnitOfWork)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{SessionFactory, SessionOptions};
    use tessera_db::{PoolHandle, PoolOptions};

    fn factory(dir: &tempfile::TempDir) -> SessionFactory {
        let path = dir.path().join("context.db");
        let pool = PoolHandle::open(path.to_str().unwrap(), PoolOptions::default()).unwrap();
        SessionFactory::new(pool, SessionOptions::default())
    }

    #[test]
    fn current_outside_scope_fails() {
        assert!(matches!(current(), Err(SessionError::NoActiveSession)));
        assert!(!in_unit_of_work());
    }

    #[test]
    fn current_inside_empty_unit_of_work_fails() {
        unit_of_work_blocking(|| {
            assert!(in_unit_of_work());
            assert!(matches!(current(), Err(SessionError::NoActiveSession)));
        });
    }

    #[test]
    fn bind_outside_unit_of_work_fails() {
        let dir = tempfile::tempdir().unwrap();
        let session = factory(&dir).create().unwrap();
        assert!(matches!(bind(session), Err(SessionError::NoUnitOfWork)));
    }

    #[test]
    fn bind_and_unbind() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);
        let session = factory.create().unwrap();
        let other = factory.create().unwrap();

        unit_of_work_blocking(|| {
            bind(session.clone()).unwrap();
            assert!(current().unwrap().ptr_eq(&session));
            assert_eq!(depth(), 1);

            bind(session.clone()).expect("rebinding the same session is a no-op");
            assert!(matches!(bind(other.clone()), Err(SessionError::AlreadyBound)));

            let removed = unbind().unwrap();
            assert!(removed.ptr_eq(&session));
            assert!(current().is_err());
            assert_eq!(depth(), 0);
        });
    }

    #[test]
    fn nested_unit_of_work_shares_slot() {
        let dir = tempfile::tempdir().unwrap();
        let session = factory(&dir).create().unwrap();

        unit_of_work_blocking(|| {
            bind(session.clone()).unwrap();
            unit_of_work_blocking(|| {
                assert!(current().unwrap().ptr_eq(&session));
            });
        });
    }

    #[test]
    fn join_and_leave_track_depth() {
        let dir = tempfile::tempdir().unwrap();
        let session = factory(&dir).create().unwrap();

        unit_of_work_blocking(|| {
            assert!(join().unwrap().is_none());
            assert!(matches!(attach(session.clone()).unwrap(), Attach::Bound));

            let (joined, depth) = join().unwrap().unwrap();
            assert!(joined.ptr_eq(&session));
            assert_eq!(depth, 2);

            assert_eq!(leave(&session), Leave::Nested(1));
            assert_eq!(leave(&session), Leave::Last);
            assert_eq!(leave(&session), Leave::Detached);
        });
    }

    #[tokio::test]
    async fn spawned_tasks_do_not_inherit_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let session = factory(&dir).create_async().await.unwrap();

        unit_of_work(async {
            bind(session.clone()).unwrap();
            let seen = tokio::spawn(async { current().is_ok() }).await.unwrap();
            assert!(!seen, "a spawned task must not see the parent's session");
            assert!(current().unwrap().ptr_eq(&session));
        })
        .await;

        assert!(current().is_err());
    }
}
