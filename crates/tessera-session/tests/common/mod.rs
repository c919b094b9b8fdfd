#![allow(dead_code)]

use std::time::Duration;
use tessera_db::{AcquirePolicy, PoolHandle, PoolOptions};
use tessera_session::{SessionFactory, SessionManager, SessionOptions};

/// Opens a file-backed pool with a `notes` table and wraps it in a manager.
pub fn setup(options: PoolOptions) -> (tempfile::TempDir, SessionManager) {
    setup_with(options, SessionOptions::default())
}

pub fn setup_with(
    options: PoolOptions,
    session_options: SessionOptions,
) -> (tempfile::TempDir, SessionManager) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("lifecycle.db");
    let pool = PoolHandle::open(path.to_str().unwrap(), options).expect("failed to open pool");
    pool.acquire()
        .expect("failed to get connection")
        .execute_batch(
            "CREATE TABLE notes (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 body TEXT NOT NULL
             );",
        )
        .expect("failed to create schema");

    let manager = SessionManager::new(SessionFactory::new(pool, session_options));
    (dir, manager)
}

pub fn default_setup() -> (tempfile::TempDir, SessionManager) {
    setup(PoolOptions::default())
}

pub fn bounded(max_size: u32, timeout: Duration) -> PoolOptions {
    PoolOptions {
        max_size,
        min_idle: 1,
        acquire: AcquirePolicy::Wait { timeout },
        ..PoolOptions::default()
    }
}

/// Counts committed notes through a fresh connection.
pub fn committed_notes(pool: &PoolHandle) -> i64 {
    pool.acquire()
        .expect("failed to get connection")
        .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
        .expect("failed to count notes")
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("domain error: {0}")]
pub struct DomainError(pub &'static str);
