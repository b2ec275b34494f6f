use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use super::{ok, ActiveSession, ApiResult};
use crate::models::{LoginRequest, RegisterRequest, VerifyEmailQuery};
use crate::session::{AuthState, Identity};
use crate::AppState;

/// POST /api/auth/login
pub async fn login(
    ActiveSession(ctx): ActiveSession,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Identity> {
    ok(ctx.auth.login(req.email.trim(), &req.password).await?)
}

/// POST /api/auth/register: the account stays inactive until the emailed
/// link is followed.
pub async fn register(
    ActiveSession(ctx): ActiveSession,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<()> {
    ctx.auth.register(&req).await?;
    ok(())
}

/// GET /api/auth/verify-email?token=
pub async fn verify_email(
    ActiveSession(ctx): ActiveSession,
    Query(query): Query<VerifyEmailQuery>,
) -> ApiResult<()> {
    ctx.auth.verify_email(&query.token).await?;
    ok(())
}

/// POST /api/auth/logout: also drops any booking in progress.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
) -> ApiResult<AuthState> {
    ctx.auth.logout().await;
    state.engine.reset(&ctx);
    ok(ctx.auth.state())
}

/// GET /api/auth/me
pub async fn me(ActiveSession(ctx): ActiveSession) -> ApiResult<AuthState> {
    ok(ctx.auth.state())
}
