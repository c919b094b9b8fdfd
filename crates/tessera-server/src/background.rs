//! Background tasks for the tessera server.
//!
//! Includes:
//! - Purging notes past their retention period, one unit of work per run.

use crate::notes;
use chrono::{DateTime, TimeDelta, Utc};
use tessera_session::{QueryError, ScopeError, SessionManager};
use tokio::time::{sleep, Duration};

/// Deletes every note older than `retention_days` in a single unit of work
/// and returns how many were removed.
///
/// # Errors
///
/// Returns `ScopeError::Session` if no session could be opened, and
/// `ScopeError::Failed` if the delete failed (the transaction is rolled back).
pub async fn purge_once(
    sessions: &SessionManager,
    retention_days: u32,
) -> Result<usize, ScopeError<QueryError>> {
    let cutoff = retention_cutoff(Utc::now(), retention_days);
    sessions
        .run(|session| async move {
            session
                .run(move |conn| notes::purge_older_than(conn, cutoff))
                .await
        })
        .await
}

fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
    TimeDelta::try_days(i64::from(retention_days))
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Starts the note purge task.
///
/// This task runs indefinitely, purging expired notes every
/// `interval_seconds`. A retention of `0` days disables it.
pub async fn start_purge_task(sessions: SessionManager, interval_seconds: u64, retention_days: u32) {
    if retention_days == 0 || interval_seconds == 0 {
        tracing::warn!(
            retention_days,
            interval_seconds,
            "note purge task disabled"
        );
        return;
    }

    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, retention_days, "starting note purge task");

    loop {
        sleep(interval).await;

        match purge_once(&sessions, retention_days).await {
            Ok(count) if count > 0 => tracing::info!(count, "purged expired notes"),
            Ok(_) => tracing::debug!("no expired notes to purge"),
            Err(ScopeError::Session(e)) if e.is_transient() => {
                tracing::warn!(error = %e, "skipped note purge, pool busy");
            }
            Err(e) => tracing::error!(error = %e, "failed to purge expired notes"),
        }
    }
}
