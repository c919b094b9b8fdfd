//! Connection pool layer for Tessera.
//!
//! Owns the long-lived pool of physical SQLite connections (via `r2d2`) that
//! every unit of work checks its session connection out of. The pool is opened
//! once at process start, shared read-only by all sessions, and closed at
//! shutdown.
//!
//! # Design decisions
//!
//! - **Bounded checkout only**: a saturated pool either fails immediately or
//!   after a bounded wait, depending on [`AcquirePolicy`]. There is no
//!   wait-forever mode.
//! - **Checkout accounting**: the handle counts connections that are currently
//!   checked out so that [`PoolHandle::close`] can drain them before shutdown.
//! - **Drain-then-fail shutdown**: closing refuses new checkouts, waits up to
//!   `drain_timeout` for open sessions to finish, and reports the remainder as
//!   a [`ShutdownError`].

mod error;
mod pool;

pub use error::{AcquireError, ConnectionError, ShutdownError};
pub use pool::{AcquirePolicy, PoolHandle, PoolOptions, PoolStatus, PooledConnection};
