//! Connection pool handle, checkout policy and shutdown draining.

use crate::error::{AcquireError, ConnectionError, ShutdownError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// What a checkout does when every pooled connection is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Fail with [`AcquireError::Exhausted`] right away.
    FailFast,
    /// Wait up to `timeout` for a connection to be returned, then fail.
    Wait {
        /// Upper bound on the wait.
        timeout: Duration,
    },
}

/// Pool sizing and connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum number of pooled connections.
    pub max_size: u32,

    /// Connections kept open while idle. Must not exceed `max_size`.
    pub min_idle: u32,

    /// Behavior of a checkout against a saturated pool.
    pub acquire: AcquirePolicy,

    /// Time allowed for establishing a brand new connection.
    pub connect_timeout: Duration,

    /// SQLite busy timeout, in milliseconds.
    pub busy_timeout_ms: u64,

    /// How long [`PoolHandle::close`] waits for open sessions to finish.
    pub drain_timeout: Duration,

    /// Defer connecting (and DSN failures) until the first checkout.
    pub lazy: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_idle: 1,
            acquire: AcquirePolicy::Wait {
                timeout: Duration::from_secs(5),
            },
            connect_timeout: Duration::from_secs(5),
            busy_timeout_ms: 5_000,
            drain_timeout: Duration::from_secs(10),
            lazy: false,
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Physical connections currently open (idle or checked out).
    pub connections: u32,
    /// Connections sitting idle in the pool.
    pub idle: u32,
    /// Connections checked out through this handle.
    pub checked_out: usize,
}

struct Shared {
    pool: Pool<SqliteConnectionManager>,
    dsn: String,
    options: PoolOptions,
    closed: AtomicBool,
    checked_out: Mutex<usize>,
    drained: Condvar,
}

impl Shared {
    fn checked_out(&self) -> MutexGuard<'_, usize> {
        self.checked_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to the process-wide connection pool.
///
/// Cloning is cheap; all clones refer to the same pool, and the physical
/// connections are torn down when the last clone is dropped.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("dsn", &self.shared.dsn)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PoolHandle {
    /// Opens a pool of SQLite connections with WAL mode, foreign keys and the
    /// configured busy timeout applied to every connection.
    ///
    /// `dsn` is a file path or a `file:` URI. Unless `options.lazy` is set,
    /// one connection is checked out and returned before this function
    /// succeeds, so an unreachable database is reported here.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::InvalidDsn` or `ConnectionError::InvalidOptions`
    /// for bad input, and `ConnectionError::Unreachable` if the database cannot
    /// be opened.
    pub fn open(dsn: &str, options: PoolOptions) -> Result<Self, ConnectionError> {
        let dsn = dsn.trim();
        if dsn.is_empty() {
            return Err(ConnectionError::InvalidDsn("DSN is empty".to_string()));
        }
        if dsn.contains('\0') {
            return Err(ConnectionError::InvalidDsn(
                "DSN contains a NUL byte".to_string(),
            ));
        }
        validate(&options)?;

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let busy_timeout_ms = options.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(dsn)
            .with_flags(flags)
            .with_init(move |conn| {
                // In-memory databases report "memory", which is acceptable.
                let journal_mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
                if journal_mode != "wal" && journal_mode != "memory" {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                        Some(format!(
                            "failed to set WAL journal mode, got: {}",
                            journal_mode
                        )),
                    ));
                }
                conn.execute_batch(&format!(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = {};",
                    busy_timeout_ms
                ))
            });

        let builder = Pool::builder()
            .max_size(options.max_size)
            .min_idle(Some(options.min_idle))
            .connection_timeout(options.connect_timeout);

        let unreachable = |source| ConnectionError::Unreachable {
            dsn: dsn.to_string(),
            source,
        };

        let pool = if options.lazy {
            builder.build_unchecked(manager)
        } else {
            let pool = builder.build(manager).map_err(unreachable)?;
            drop(
                pool.get_timeout(options.connect_timeout)
                    .map_err(unreachable)?,
            );
            pool
        };

        tracing::info!(
            dsn,
            max_size = options.max_size,
            lazy = options.lazy,
            "opened connection pool"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                dsn: dsn.to_string(),
                options,
                closed: AtomicBool::new(false),
                checked_out: Mutex::new(0),
                drained: Condvar::new(),
            }),
        })
    }

    /// Checks one connection out of the pool according to the configured
    /// [`AcquirePolicy`]. The connection goes back to the pool when the
    /// returned value is dropped.
    ///
    /// # Errors
    ///
    /// `AcquireError::Closed` after [`close`](Self::close),
    /// `AcquireError::Exhausted` when the pool stays saturated, and
    /// `AcquireError::Connection` when a new connection cannot be opened.
    pub fn acquire(&self) -> Result<PooledConnection, AcquireError> {
        if self.is_closed() {
            return Err(AcquireError::Closed);
        }

        // Counted before the checkout so that a concurrent `close` waits for us.
        let lease = Lease::reserve(Arc::clone(&self.shared));
        let started = Instant::now();
        let pool = &self.shared.pool;

        let conn = match self.shared.options.acquire {
            AcquirePolicy::FailFast => {
                if self.saturated() {
                    return Err(self.exhausted(started));
                }
                match pool.try_get() {
                    Some(conn) => conn,
                    // Lost the last idle connection to another checkout.
                    None if !self.can_grow() => return Err(self.exhausted(started)),
                    None => pool
                        .get_timeout(self.shared.options.connect_timeout)
                        .map_err(|e| self.classify(started, e))?,
                }
            }
            AcquirePolicy::Wait { timeout } => pool
                .get_timeout(timeout)
                .map_err(|e| self.classify(started, e))?,
        };

        tracing::trace!(
            waited_ms = started.elapsed().as_millis() as u64,
            "checked out pooled connection"
        );

        Ok(PooledConnection { conn, _lease: lease })
    }

    /// Closes the handle for shutdown.
    ///
    /// New checkouts fail with [`AcquireError::Closed`] from here on. The call
    /// then blocks until every checked-out connection has been returned or
    /// `drain_timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownError` with the number of sessions still open when the
    /// drain timed out. Those connections are still returned to the pool when
    /// their scopes end.
    pub fn close(&self) -> Result<(), ShutdownError> {
        self.shared.closed.store(true, Ordering::Release);

        let guard = self.shared.checked_out();
        let (guard, _) = self
            .shared
            .drained
            .wait_timeout_while(guard, self.shared.options.drain_timeout, |open| *open > 0)
            .unwrap_or_else(PoisonError::into_inner);
        let open_sessions = *guard;
        drop(guard);

        if open_sessions > 0 {
            tracing::error!(
                dsn = %self.shared.dsn,
                open_sessions,
                "connection pool closed with sessions still open"
            );
            return Err(ShutdownError { open_sessions });
        }

        tracing::info!(dsn = %self.shared.dsn, "connection pool closed");
        Ok(())
    }

    /// Whether [`close`](Self::close) has been called on any clone.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Current pool occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.pool.state();
        PoolStatus {
            connections: state.connections,
            idle: state.idle_connections,
            checked_out: *self.shared.checked_out(),
        }
    }

    /// The DSN this pool was opened with.
    pub fn dsn(&self) -> &str {
        &self.shared.dsn
    }

    /// The options this pool was opened with.
    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    fn saturated(&self) -> bool {
        let state = self.shared.pool.state();
        state.idle_connections == 0 && state.connections >= self.shared.options.max_size
    }

    /// Whether r2d2 may still open a new physical connection.
    fn can_grow(&self) -> bool {
        self.shared.pool.state().connections < self.shared.options.max_size
    }

    fn exhausted(&self, started: Instant) -> AcquireError {
        let waited = started.elapsed();
        tracing::warn!(
            dsn = %self.shared.dsn,
            waited_ms = waited.as_millis() as u64,
            max_size = self.shared.options.max_size,
            "connection pool exhausted"
        );
        AcquireError::Exhausted {
            waited,
            max_size: self.shared.options.max_size,
        }
    }

    fn classify(&self, started: Instant, err: r2d2::Error) -> AcquireError {
        if self.saturated() {
            self.exhausted(started)
        } else {
            AcquireError::Connection(err)
        }
    }
}

fn validate(options: &PoolOptions) -> Result<(), ConnectionError> {
    if options.max_size == 0 {
        return Err(ConnectionError::InvalidOptions(
            "max_size must be positive".to_string(),
        ));
    }
    if options.min_idle > options.max_size {
        return Err(ConnectionError::InvalidOptions(format!(
            "min_idle ({}) exceeds max_size ({})",
            options.min_idle, options.max_size
        )));
    }
    if options.connect_timeout.is_zero() {
        return Err(ConnectionError::InvalidOptions(
            "connect_timeout must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Counts one checked-out connection for as long as it lives.
struct Lease {
    shared: Arc<Shared>,
}

impl Lease {
    fn reserve(shared: Arc<Shared>) -> Self {
        *shared.checked_out() += 1;
        Self { shared }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut open = self.shared.checked_out();
        *open = open.saturating_sub(1);
        if *open == 0 {
            self.shared.drained.notify_all();
        }
    }
}

/// A connection checked out of a [`PoolHandle`].
///
/// Dereferences to [`rusqlite::Connection`]. Dropping it returns the
/// connection to the pool and then releases the checkout count.
pub struct PooledConnection {
    // Field order matters: the connection must be back in the pool before the
    // lease wakes up a draining `close`.
    conn: r2d2::PooledConnection<SqliteConnectionManager>,
    _lease: Lease,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("dsn", &self._lease.shared.dsn)
            .field("autocommit", &self.conn.is_autocommit())
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn file_pool(dir: &tempfile::TempDir, options: PoolOptions) -> PoolHandle {
        let path = dir.path().join("pool.db");
        PoolHandle::open(path.to_str().unwrap(), options).expect("pool creation should succeed")
    }

    #[test]
    fn open_applies_connection_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let options = PoolOptions {
            busy_timeout_ms: 2_500,
            max_size: 3,
            ..PoolOptions::default()
        };
        let pool = file_pool(&dir, options);
        let conn = pool.acquire().expect("should get a connection");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert_eq!(mode, "wal");

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1, "foreign keys should be enabled");

        let busy_timeout: i32 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500, "busy timeout should match options");
    }

    #[test]
    fn open_rejects_empty_dsn() {
        let err = PoolHandle::open("   ", PoolOptions::default()).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidDsn(_)));
    }

    #[test]
    fn open_rejects_min_idle_above_max_size() {
        let options = PoolOptions {
            max_size: 2,
            min_idle: 3,
            ..PoolOptions::default()
        };
        let err = PoolHandle::open("unused.db", options).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidOptions(_)));
    }

    #[test]
    fn open_reports_unreachable_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("nested").join("db.sqlite");
        let options = PoolOptions {
            connect_timeout: Duration::from_millis(200),
            ..PoolOptions::default()
        };

        let err = PoolHandle::open(path.to_str().unwrap(), options).unwrap_err();
        assert!(
            matches!(err, ConnectionError::Unreachable { .. }),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn lazy_pool_defers_failure_to_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("db.sqlite");
        let options = PoolOptions {
            lazy: true,
            min_idle: 0,
            acquire: AcquirePolicy::Wait {
                timeout: Duration::from_millis(200),
            },
            connect_timeout: Duration::from_millis(200),
            ..PoolOptions::default()
        };

        let pool = PoolHandle::open(path.to_str().unwrap(), options)
            .expect("lazy open should not touch the database");
        let err = pool.acquire().unwrap_err();
        assert!(
            matches!(err, AcquireError::Connection(_)),
            "unexpected error: {err:?}"
        );
        assert_eq!(pool.status().checked_out, 0);
    }

    #[test]
    fn fail_fast_reports_exhaustion_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let options = PoolOptions {
            max_size: 1,
            acquire: AcquirePolicy::FailFast,
            ..PoolOptions::default()
        };
        let pool = file_pool(&dir, options);

        let held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        match err {
            AcquireError::Exhausted { max_size, .. } => assert_eq!(max_size, 1),
            other => panic!("unexpected error: {other:?}"),
        }

        drop(held);
        assert!(pool.acquire().is_ok(), "connection should be reusable");
    }

    #[test]
    fn fail_fast_never_waits_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let options = PoolOptions {
            max_size: 2,
            min_idle: 2,
            acquire: AcquirePolicy::FailFast,
            connect_timeout: Duration::from_secs(5),
            ..PoolOptions::default()
        };
        let pool = file_pool(&dir, options);

        let slowest = thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let mut slowest = Duration::ZERO;
                        for _ in 0..50 {
                            let started = Instant::now();
                            match pool.acquire() {
                                Ok(conn) => {
                                    slowest = slowest.max(started.elapsed());
                                    thread::sleep(Duration::from_millis(1));
                                    drop(conn);
                                }
                                Err(AcquireError::Exhausted { .. }) => {
                                    slowest = slowest.max(started.elapsed());
                                }
                                Err(other) => panic!("unexpected error: {other:?}"),
                            }
                        }
                        slowest
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .max()
                .unwrap_or_default()
        });

        assert!(
            slowest < Duration::from_secs(1),
            "fail-fast checkout blocked for {slowest:?}"
        );
        assert_eq!(pool.status().checked_out, 0);
    }

    #[test]
    fn bounded_wait_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let options = PoolOptions {
            max_size: 1,
            acquire: AcquirePolicy::Wait {
                timeout: Duration::from_millis(100),
            },
            ..PoolOptions::default()
        };
        let pool = file_pool(&dir, options);

        let _held = pool.acquire().unwrap();
        let started = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, AcquireError::Exhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn status_tracks_checkouts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir, PoolOptions::default());
        assert_eq!(pool.status().checked_out, 0);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.status().checked_out, 2);

        drop(a);
        drop(b);
        let status = pool.status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, status.connections);
    }

    #[test]
    fn close_waits_for_open_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let options = PoolOptions {
            drain_timeout: Duration::from_secs(5),
            ..PoolOptions::default()
        };
        let pool = file_pool(&dir, options);

        let held = pool.acquire().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(held);
        });

        pool.close().expect("close should drain");
        releaser.join().unwrap();

        assert!(matches!(pool.acquire(), Err(AcquireError::Closed)));
    }

    #[test]
    fn close_reports_leaked_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let options = PoolOptions {
            drain_timeout: Duration::from_millis(50),
            ..PoolOptions::default()
        };
        let pool = file_pool(&dir, options);

        let _held = pool.acquire().unwrap();
        let err = pool.close().unwrap_err();
        assert_eq!(err, ShutdownError { open_sessions: 1 });
        assert!(pool.is_closed());
    }
}
