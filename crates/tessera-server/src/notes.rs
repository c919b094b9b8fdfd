//! Storage for the notes served by the demo API.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use tessera_session::{Query, QueryError};

/// A stored note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Row identifier.
    pub id: i64,
    /// Note text.
    pub body: String,
    /// RFC 3339 creation timestamp (UTC).
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// Creates the `notes` table if it does not exist.
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS notes (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             body TEXT NOT NULL,
             created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_notes_created_at ON notes (created_at);",
    )
}

fn note(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        body: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Inserts a note stamped with the current time.
pub fn insert_note(conn: &Connection, body: &str) -> Result<Note, QueryError> {
    insert_note_at(conn, body, Utc::now())
}

/// Inserts a note with an explicit creation time.
pub fn insert_note_at(
    conn: &Connection,
    body: &str,
    created_at: DateTime<Utc>,
) -> Result<Note, QueryError> {
    conn.execute(
        "INSERT INTO notes (body, created_at) VALUES (?1, ?2)",
        (body, timestamp(created_at)),
    )?;
    let id = conn.last_insert_rowid();
    Query::new(conn).one(
        "SELECT id, body, created_at FROM notes WHERE id = ?1",
        [id],
        note,
    )
}

pub fn get_note(conn: &Connection, id: i64) -> Result<Option<Note>, QueryError> {
    Query::new(conn).one_or_none(
        "SELECT id, body, created_at FROM notes WHERE id = ?1",
        [id],
        note,
    )
}

/// Most recent notes first.
pub fn list_notes(conn: &Connection, limit: u32) -> Result<Vec<Note>, QueryError> {
    Query::new(conn).all(
        "SELECT id, body, created_at FROM notes ORDER BY id DESC LIMIT ?1",
        [limit],
        note,
    )
}

pub fn count_notes(conn: &Connection) -> Result<u64, QueryError> {
    Query::new(conn).count("SELECT id FROM notes", [])
}

/// Deletes notes created before `cutoff` and returns how many went.
pub fn purge_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize, QueryError> {
    let cutoff = timestamp(cutoff);
    if !Query::new(conn).exists("SELECT 1 FROM notes WHERE created_at < ?1", [&cutoff])? {
        return Ok(0);
    }
    Ok(conn.execute("DELETE FROM notes WHERE created_at < ?1", [&cutoff])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn insert_and_fetch() {
        let conn = conn();
        let created = insert_note(&conn, "hello").unwrap();
        assert_eq!(created.body, "hello");
        assert!(created.created_at.ends_with('Z'));

        assert_eq!(get_note(&conn, created.id).unwrap(), Some(created));
        assert_eq!(get_note(&conn, 999).unwrap(), None);
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let conn = conn();
        for body in ["a", "b", "c"] {
            insert_note(&conn, body).unwrap();
        }

        let listed = list_notes(&conn, 2).unwrap();
        let bodies: Vec<_> = listed.iter().map(|n| n.body.as_str()).collect();
        assert_eq!(bodies, vec!["c", "b"]);
        assert_eq!(count_notes(&conn).unwrap(), 3);
    }

    #[test]
    fn purge_removes_only_old_notes() {
        let conn = conn();
        let now = Utc::now();
        insert_note_at(&conn, "ancient", now - TimeDelta::days(90)).unwrap();
        insert_note_at(&conn, "old", now - TimeDelta::days(31)).unwrap();
        insert_note(&conn, "fresh").unwrap();

        let purged = purge_older_than(&conn, now - TimeDelta::days(30)).unwrap();
        assert_eq!(purged, 2);
        assert_eq!(count_notes(&conn).unwrap(), 1);

        assert_eq!(purge_older_than(&conn, now - TimeDelta::days(30)).unwrap(), 0);
    }
}
