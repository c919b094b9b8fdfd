//! Per-request database unit of work.
//!
//! [`db_session_middleware`] gives each request its own session: it opens a
//! unit of work and a scope before the handler runs, then commits or rolls
//! back depending on the response. Handlers reach the session through the
//! [`CurrentSession`] extractor or [`tessera_session::current`].

use crate::api::ApiError;
use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tessera_session::{context, current, Outcome, ScopeError, Session, SessionManager};
use thiserror::Error;

/// Response extension that forces a rollback even for a non-error status.
///
/// Every [`ApiError`] response carries it. Handlers can add it themselves,
/// e.g. `(Extension(RollbackOnly), Json(preview))` for a dry run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackOnly;

/// Failure recorded for a response that must not be committed.
#[derive(Debug, Clone, Copy, Error)]
#[error("handler responded with {status}")]
pub struct HandlerFailure {
    pub status: StatusCode,
}

/// Classifies a finished response: server errors and rollback-only responses
/// fail the unit of work, everything else succeeds.
pub fn classify(response: &Response) -> Outcome<HandlerFailure> {
    let status = response.status();
    if status.is_server_error() || response.extensions().get::<RollbackOnly>().is_some() {
        Outcome::Failed(HandlerFailure { status })
    } else {
        Outcome::Success
    }
}

/// Wraps the request in a unit of work with one database session.
///
/// - `503` with `Retry-After` when the pool stays exhausted, `500` when the
///   session cannot be opened for any other reason.
/// - A commit failure replaces the handler's response with `500`.
/// - A failed rollback is logged and the handler's response is kept.
///
/// A panicking handler unwinds through the scope, which rolls back and returns
/// the connection; an outer `CatchPanicLayer` turns the panic into `500`.
pub async fn db_session_middleware(
    State(sessions): State<SessionManager>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    context::unit_of_work(async move {
        let guard = match sessions.enter_async().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!(%method, %path, error = %err, "could not open database session");
                return ApiError::from(err).into_response();
            }
        };
        let session_id = guard.session().id();

        let response = next.run(req).await;

        match classify(&response) {
            Outcome::Success => match guard.exit_async(Outcome::<HandlerFailure>::Success).await {
                Ok(()) => response,
                Err(err) => {
                    tracing::error!(%session_id, %method, %path, error = %err, "failed to commit request");
                    ApiError::InternalServerError("failed to commit transaction".to_string())
                        .into_response()
                }
            },
            Outcome::Failed(failure) => {
                tracing::debug!(%session_id, status = %failure.status, "rolling back request");
                if let Err(ScopeError::RollbackFailed { rollback, .. }) =
                    guard.exit_async(Outcome::Failed(failure)).await
                {
                    tracing::error!(%session_id, %method, %path, error = %rollback, "failed to roll back request");
                }
                response
            }
        }
    })
    .await
}

/// Extractor for the session bound to the current request.
///
/// Rejects with `500` when the route is not wrapped in
/// [`db_session_middleware`].
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Session);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        current().map(CurrentSession).map_err(ApiError::from)
    }
}
