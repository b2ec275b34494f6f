use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tower_sessions::Session;

use crate::error::EngineError;
use crate::models::ApiResponse;
use crate::session::cookie::{bind_new_session, bound_session};
use crate::session::AuthState;
use crate::AppState;

/// POST /api/session: bind a booking session to the caller's cookie, or
/// re-confirm the one it already carries.
pub async fn open_session(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> Result<(StatusCode, Json<ApiResponse<AuthState>>), EngineError> {
    let (id, status) = match bound_session(&session).await {
        Some(id) => (id, StatusCode::OK),
        None => {
            let id = bind_new_session(&session).await?;
            tracing::info!("Opened session {}", id);
            (id, StatusCode::CREATED)
        }
    };

    // Restores persisted tokens for a returning session.
    let ctx = state.registry.context(&id).await;
    Ok((status, Json(ApiResponse::success(ctx.auth.state()))))
}
