//! Booking gateway for a single-stylist salon.
//!
//! Sits between the browser and the remote appointment API: keeps each
//! browser session's tokens and booking flow, computes slot availability,
//! and runs the deposit payment round trip with Paystack or Stripe before
//! an appointment is created.

pub mod booking;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod payment;
pub mod pricing;
pub mod rate_limit;
pub mod repository;
pub mod session;
pub mod slots;

#[cfg(test)]
pub mod testing;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;

use crate::booking::BookingEngine;
use crate::config::Config;
use crate::rate_limit::{enforce, RateLimiter, Tier};
use crate::session::cookie::create_session_layer;
use crate::session::SessionRegistry;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub registry: SessionRegistry,
    pub engine: BookingEngine,
    pub started_at: Instant,
}

/// The API router, grouped by rate-limit tier, behind the session layer.
pub fn app(state: Arc<AppState>, limiter: RateLimiter) -> Router {
    // 1. No limit: health checks
    let no_limit_routes = Router::new().route("/api/health", get(handlers::health::health));

    // 2. Public: session issue and catalog
    let public_routes = Router::new()
        .route("/api/session", post(handlers::session::open_session))
        .route("/api/categories", get(handlers::booking::categories))
        .layer(from_fn_with_state((limiter.clone(), Tier::Public), enforce));

    // 3. Auth: credential endpoints
    let auth_routes = Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/register", post(handlers::auth::register))
        .route("/api/auth/verify-email", get(handlers::auth::verify_email))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/auth/me", get(handlers::auth::me))
        .layer(from_fn_with_state((limiter.clone(), Tier::Auth), enforce));

    // 4. Booking: flow steps and the dashboard
    let booking_routes = Router::new()
        .route("/api/slots", get(handlers::booking::slots))
        .route("/api/booking", get(handlers::booking::current))
        .route("/api/booking/start", post(handlers::booking::start))
        .route("/api/booking/reschedule", post(handlers::booking::reschedule))
        .route("/api/booking/category", post(handlers::booking::choose_category))
        .route(
            "/api/booking/services/{id}/toggle",
            post(handlers::booking::toggle_service),
        )
        .route(
            "/api/booking/services/continue",
            post(handlers::booking::continue_to_schedule),
        )
        .route("/api/booking/date", post(handlers::booking::choose_date))
        .route("/api/booking/time", post(handlers::booking::choose_time))
        .route(
            "/api/booking/details",
            post(handlers::booking::continue_to_details),
        )
        .route("/api/booking/back", post(handlers::booking::back))
        .route("/api/appointments", get(handlers::appointments::list))
        .route(
            "/api/appointments/summary",
            get(handlers::appointments::summary),
        )
        .route(
            "/api/appointments/{id}",
            delete(handlers::appointments::delete),
        )
        .route(
            "/api/appointments/{id}/cancel",
            post(handlers::appointments::cancel),
        )
        .route(
            "/api/appointments/{id}/status",
            patch(handlers::appointments::set_status),
        )
        .layer(from_fn_with_state((limiter.clone(), Tier::Booking), enforce));

    // 5. Payment: submissions open a gateway transaction
    let payment_routes = Router::new()
        .route("/api/booking/submit", post(handlers::booking::submit))
        .layer(from_fn_with_state((limiter.clone(), Tier::Payment), enforce));

    // 6. Callback: returns from the gateway, charged separately from submits
    let callback_routes = Router::new()
        .route(
            "/api/payments/paystack/callback",
            get(handlers::payment::paystack_callback),
        )
        .route(
            "/api/payments/stripe/callback",
            get(handlers::payment::stripe_callback),
        )
        .layer(from_fn_with_state((limiter, Tier::Callback), enforce));

    let sessions = create_session_layer(&state.db, &state.config);

    Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(auth_routes)
        .merge(booking_routes)
        .merge(payment_routes)
        .merge(callback_routes)
        .layer(sessions)
        .with_state(state)
}
