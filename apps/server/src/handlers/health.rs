use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::models::PaymentProvider;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub db_ok: bool,
    pub open_sessions: usize,
    pub payment_providers: Vec<PaymentProvider>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_ok = sqlx::query("SELECT 1")
        .execute(&state.db)
        .await
        .is_ok();

    Json(HealthResponse {
        status: if db_ok { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        db_ok,
        open_sessions: state.registry.len(),
        payment_providers: state.engine.payments().providers(),
    })
}
