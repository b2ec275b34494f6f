use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use super::{ok, ActiveSession, ApiResult};
use crate::booking::FlowView;
use crate::models::{
    ChooseCategoryRequest, ChooseDateRequest, ChooseTimeRequest, DaySlots, RescheduleRequest,
    ServiceCategory, SlotsQuery, SubmitRequest,
};
use crate::AppState;

/// GET /api/categories
pub async fn categories(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ServiceCategory>> {
    ok(state.engine.categories().await?)
}

/// GET /api/slots?date=: `data` is null when a newer load for this session
/// superseded the request.
pub async fn slots(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Query(query): Query<SlotsQuery>,
) -> ApiResult<Option<DaySlots>> {
    ok(state.engine.load_slots(&ctx, query.date).await?)
}

/// GET /api/booking
pub async fn current(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
) -> ApiResult<FlowView> {
    ok(state.engine.view(&ctx))
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
) -> ApiResult<FlowView> {
    ok(state.engine.reset(&ctx))
}

pub async fn reschedule(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Json(req): Json<RescheduleRequest>,
) -> ApiResult<FlowView> {
    ok(state.engine.begin_reschedule(&ctx, req.appointment_id).await?)
}

pub async fn choose_category(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Json(req): Json<ChooseCategoryRequest>,
) -> ApiResult<FlowView> {
    ok(state.engine.choose_category(&ctx, req.category_id).await?)
}

pub async fn toggle_service(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Path(service_id): Path<i64>,
) -> ApiResult<FlowView> {
    ok(state.engine.toggle_service(&ctx, service_id)?)
}

pub async fn continue_to_schedule(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
) -> ApiResult<FlowView> {
    ok(state.engine.continue_to_schedule(&ctx)?)
}

/// POST /api/booking/date: also loads the day's slots.
pub async fn choose_date(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Json(req): Json<ChooseDateRequest>,
) -> ApiResult<FlowView> {
    ok(state.engine.choose_date(&ctx, req.date).await?)
}

pub async fn choose_time(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Json(req): Json<ChooseTimeRequest>,
) -> ApiResult<FlowView> {
    ok(state.engine.choose_time(&ctx, req.time)?)
}

pub async fn continue_to_details(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
) -> ApiResult<FlowView> {
    ok(state.engine.continue_to_details(&ctx)?)
}

pub async fn back(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
) -> ApiResult<FlowView> {
    ok(state.engine.back(&ctx)?)
}

/// POST /api/booking/submit: a new booking answers with the awaiting
/// payment state carrying the gateway redirect.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    ActiveSession(ctx): ActiveSession,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<FlowView> {
    ok(state.engine.submit(&ctx, req).await?)
}
