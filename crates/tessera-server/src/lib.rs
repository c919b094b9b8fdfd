//! Tessera server library logic.

pub mod api;
pub mod background;
pub mod config;
pub mod middleware;
pub mod notes;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tessera_session::SessionManager;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Health check handler.
///
/// Returns `200 OK` with server status, version and pool occupancy. Does not
/// open a session.
async fn health(State(sessions): State<SessionManager>) -> Json<Value> {
    let status = sessions.pool().status();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pool": {
            "connections": status.connections,
            "idle": status.idle,
            "checkedOut": status.checked_out,
        }
    }))
}

/// Wraps every route of `router` in a database unit of work.
///
/// Panics inside handlers are turned into `500` responses after the scope has
/// rolled back and released its connection.
pub fn scoped<S>(router: Router<S>, sessions: SessionManager) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .route_layer(axum::middleware::from_fn_with_state(
            sessions,
            middleware::db_session_middleware,
        ))
        .layer(CatchPanicLayer::new())
}

/// Builds the application router with all routes.
pub fn app(sessions: SessionManager) -> Router {
    let notes = Router::new()
        .route(
            "/api/notes",
            get(api::list_notes_handler).post(api::create_note_handler),
        )
        .route("/api/notes/batch", post(api::create_notes_batch_handler))
        .route("/api/notes/{id}", get(api::get_note_handler));

    Router::new()
        .route("/health", get(health))
        .merge(scoped(notes, sessions.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(sessions)
}
