//! API handlers for the notes service.
//!
//! Every handler here runs inside the request's unit of work and reaches the
//! database through [`CurrentSession`]. Returning an [`ApiError`] marks the
//! response rollback-only, so a handler that fails halfway through leaves no
//! partial writes behind.

use crate::middleware::{CurrentSession, RollbackOnly};
use crate::notes::{self, Note};
use axum::{
    extract::{Json, Path, Query},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tessera_session::{QueryError, SessionError};
use thiserror::Error;

/// Maximum accepted note length in bytes.
pub const MAX_NOTE_LEN: usize = 4096;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

/// Seconds a client is asked to wait when no connection is available.
const RETRY_AFTER_SECS: &str = "1";

/// Request body for note creation.
#[derive(Debug, Deserialize)]
pub struct CreateNoteRequest {
    pub body: String,
}

/// Request body for creating several notes at once.
#[derive(Debug, Deserialize)]
pub struct CreateNotesRequest {
    pub bodies: Vec<String>,
}

/// Query parameters for listing notes.
#[derive(Debug, Default, Deserialize)]
pub struct ListNotesParams {
    pub limit: Option<u32>,
}

/// Response body for note listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListNotesResponse {
    /// Most recent notes first.
    pub notes: Vec<Note>,
    /// Total number of stored notes.
    pub total: u64,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(RollbackOnly);
        if matches!(self, ApiError::Unavailable(_)) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        if err.is_transient() {
            ApiError::Unavailable(err.to_string())
        } else {
            ApiError::InternalServerError(err.to_string())
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::NoResult => ApiError::NotFound("no matching record".to_string()),
            QueryError::Session(e) => e.into(),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

fn validate_body(body: &str) -> Result<(), ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::BadRequest("note body must not be empty".to_string()));
    }
    if body.len() > MAX_NOTE_LEN {
        return Err(ApiError::BadRequest(format!(
            "note body exceeds {MAX_NOTE_LEN} bytes"
        )));
    }
    Ok(())
}

/// Handler for `POST /api/notes`.
pub async fn create_note_handler(
    CurrentSession(session): CurrentSession,
    Json(payload): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<Note>), ApiError> {
    validate_body(&payload.body)?;

    let note = session
        .run(move |conn| notes::insert_note(conn, &payload.body))
        .await?;

    tracing::debug!(note_id = note.id, session_id = %session.id(), "created note");
    Ok((StatusCode::CREATED, Json(note)))
}

/// Handler for `POST /api/notes/batch`.
///
/// All notes are written in the request's transaction: one invalid body
/// rejects the whole batch, including notes already inserted before it.
pub async fn create_notes_batch_handler(
    CurrentSession(session): CurrentSession,
    Json(payload): Json<CreateNotesRequest>,
) -> Result<(StatusCode, Json<Vec<Note>>), ApiError> {
    if payload.bodies.is_empty() {
        return Err(ApiError::BadRequest("batch must not be empty".to_string()));
    }

    let created = session
        .run(move |conn| {
            let mut created = Vec::with_capacity(payload.bodies.len());
            for (index, body) in payload.bodies.iter().enumerate() {
                validate_body(body).map_err(|e| match e {
                    ApiError::BadRequest(msg) => ApiError::BadRequest(format!("note {index}: {msg}")),
                    other => other,
                })?;
                created.push(notes::insert_note(conn, body)?);
            }
            Ok::<_, ApiError>(created)
        })
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

/// Handler for `GET /api/notes/{id}`.
pub async fn get_note_handler(
    CurrentSession(session): CurrentSession,
    Path(id): Path<i64>,
) -> Result<Json<Note>, ApiError> {
    let note = session.run(move |conn| notes::get_note(conn, id)).await?;
    note.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("note {id}")))
}

/// Handler for `GET /api/notes`.
pub async fn list_notes_handler(
    CurrentSession(session): CurrentSession,
    Query(params): Query<ListNotesParams>,
) -> Result<Json<ListNotesResponse>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let (notes, total) = session
        .run(move |conn| {
            let notes = notes::list_notes(conn, limit)?;
            let total = notes::count_notes(conn)?;
            Ok::<_, QueryError>((notes, total))
        })
        .await?;

    Ok(Json(ListNotesResponse { notes, total }))
}
