#![allow(dead_code)]

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tessera_db::{PoolHandle, PoolOptions};
use tessera_server::notes;
use tessera_session::{SessionFactory, SessionManager, SessionOptions};
use tower::ServiceExt;

/// Opens a file-backed pool with the notes schema.
pub fn setup(options: PoolOptions) -> (tempfile::TempDir, SessionManager) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("server.db");
    let pool = PoolHandle::open(path.to_str().unwrap(), options).expect("failed to open pool");
    {
        let conn = pool.acquire().expect("failed to get connection");
        notes::ensure_schema(&conn).expect("failed to create schema");
    }
    let manager = SessionManager::new(SessionFactory::new(pool, SessionOptions::default()));
    (dir, manager)
}

pub fn default_setup() -> (tempfile::TempDir, SessionManager) {
    setup(PoolOptions::default())
}

pub fn note_count(pool: &PoolHandle) -> i64 {
    pool.acquire()
        .expect("failed to get connection")
        .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
        .expect("failed to count notes")
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub json: Value,
}

/// Sends one request through `app`. Non-JSON bodies come back as `Value::Null`.
pub async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    TestResponse {
        status,
        headers,
        json,
    }
}
