//! Per-unit-of-work database sessions.
//!
//! A *unit of work* is one logical operation (an HTTP request, a background
//! task run, a test case) that must see an all-or-nothing view of its database
//! changes. This crate gives each unit of work exactly one [`Session`]: a
//! connection checked out of the shared [`tessera_db::PoolHandle`] plus its
//! transaction. The session is committed or rolled back from the explicit
//! [`Outcome`] of the work, and its connection always goes back to the pool.
//!
//! # Layout
//!
//! - [`SessionFactory`] checks connections out and wraps them in sessions.
//! - [`SessionManager`] enters and exits re-entrant scopes ([`ScopeGuard`]) and
//!   offers the `run` helpers that classify a `Result` into an [`Outcome`].
//! - [`context`] binds the active session to the current task or thread, so
//!   [`current()`] works at any call depth without threading parameters.
//! - [`Query`] provides single-row/collection helpers over a connection.
//!
//! ```ignore
//! let sessions = SessionManager::new(SessionFactory::new(pool, SessionOptions::default()));
//! let id = sessions
//!     .run(|session| async move {
//!         session
//!             .run(|conn| {
//!                 conn.execute("INSERT INTO notes (body) VALUES ('a')", [])?;
//!                 Ok::<_, SessionError>(conn.last_insert_rowid())
//!             })
//!             .await
//!     })
//!     .await?;
//! ```

pub mod context;
mod error;
mod factory;
mod outcome;
mod query;
mod scope;
mod session;

pub use context::current;
pub use error::{CommitError, DoubleExitWarning, ScopeError, SessionError};
pub use factory::{BeginMode, SessionFactory, SessionOptions};
pub use outcome::{Decision, Outcome};
pub use query::{Query, QueryError, DEFAULT_BATCH_SIZE};
pub use scope::{ScopeGuard, SessionManager};
pub use session::{Finished, Session, TxState};
