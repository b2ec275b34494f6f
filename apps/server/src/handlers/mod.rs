pub mod appointments;
pub mod auth;
pub mod booking;
pub mod health;
pub mod payment;
pub mod session;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tower_sessions::Session;

use crate::error::EngineError;
use crate::models::ApiResponse;
use crate::session::cookie::bound_session;
use crate::session::SessionContext;
use crate::AppState;

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, EngineError>;

pub(crate) fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

/// Open the context of the booking session bound to the request's cookie.
pub async fn resolve_session(state: &AppState, session: &Session) -> Option<Arc<SessionContext>> {
    let id = bound_session(session).await?;
    Some(state.registry.context(&id).await)
}

/// Extractor for handlers that need a live session.
pub struct ActiveSession(pub Arc<SessionContext>);

impl FromRequestParts<Arc<AppState>> for ActiveSession {
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let rejected = || {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::error("Missing or invalid session")),
            )
        };
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(|_| rejected())?;
        resolve_session(state, &session)
            .await
            .map(ActiveSession)
            .ok_or_else(rejected)
    }
}
