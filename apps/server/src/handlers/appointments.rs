use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use super::{ok, ActiveSession, ApiResult};
use crate::booking::{AppointmentBoard, StatusSummary};
use crate::models::{Appointment, AppointmentsQuery, StatusChangeRequest};
use crate::AppState;

/// GET /api/appointments: the caller's own, or everyone's for admins.
pub async fn list(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Query(query): Query<AppointmentsQuery>,
) -> ApiResult<AppointmentBoard> {
    ok(state.engine.appointments(&ctx, query.status).await?)
}

/// GET /api/appointments/summary
pub async fn summary(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
) -> ApiResult<StatusSummary> {
    ok(state.engine.summary(&ctx).await?)
}

/// POST /api/appointments/{id}/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Path(id): Path<i64>,
) -> ApiResult<Appointment> {
    ok(state.engine.cancel(&ctx, id).await?)
}

/// PATCH /api/appointments/{id}/status (admin)
pub async fn set_status(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Path(id): Path<i64>,
    Json(req): Json<StatusChangeRequest>,
) -> ApiResult<Appointment> {
    ok(state.engine.set_status(&ctx, id, req.status).await?)
}

/// DELETE /api/appointments/{id} (admin)
pub async fn delete(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Path(id): Path<i64>,
) -> ApiResult<()> {
    state.engine.delete(&ctx, id).await?;
    ok(())
}
