use axum::http::{header, HeaderValue, Method};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tower_sessions::session_store::ExpiredDeletion;
use tower_sessions_sqlx_store::SqliteStore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use stylist_booking::booking::BookingEngine;
use stylist_booking::config::Config;
use stylist_booking::db::{self, SqliteTokenStore, SqliteTransactionStore};
use stylist_booking::payment::{paystack::PaystackGateway, stripe::StripeGateway, PaymentProtocol};
use stylist_booking::rate_limit::RateLimiter;
use stylist_booking::repository::http::RemoteApi;
use stylist_booking::session::SessionRegistry;
use stylist_booking::slots::BusinessClock;
use stylist_booking::{app, AppState};

/// Idle session and expired cookie sweep interval (seconds).
const SESSION_SWEEP_SECS: u64 = 300;
/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;
/// Timeout for every outbound call (remote API and gateways).
const OUTBOUND_TIMEOUT_SECS: u64 = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()?;
    let clock = BusinessClock::new(config.business_utc_offset_minutes).ok_or_else(|| {
        anyhow::anyhow!(
            "BUSINESS_UTC_OFFSET_MINUTES={} is not a valid UTC offset",
            config.business_utc_offset_minutes
        )
    })?;

    // ── Database ──
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    db::run_migrations(&pool).await?;

    // ── Outbound clients ──
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(OUTBOUND_TIMEOUT_SECS))
        .build()?;
    let remote = Arc::new(RemoteApi::new(http.clone(), config.api_base_url.clone()));

    let mut payments = PaymentProtocol::new(Arc::new(SqliteTransactionStore::new(pool.clone())));
    match config.paystack.take() {
        Some(paystack) => {
            payments = payments.with_gateway(Arc::new(PaystackGateway::new(
                http.clone(),
                paystack.base_url,
                paystack.secret_key,
                config.callback_url("paystack"),
            )));
        }
        None => tracing::warn!("PAYSTACK_SECRET_KEY not set, Paystack payments disabled"),
    }
    match config.stripe.take() {
        Some(stripe) => {
            payments = payments.with_gateway(Arc::new(StripeGateway::new(
                http.clone(),
                stripe.base_url,
                stripe.secret_key,
                stripe.currency,
                config.callback_url("stripe"),
                config.frontend_link("/booking", Some("payment=cancelled")),
            )));
        }
        None => tracing::warn!("STRIPE_SECRET_KEY not set, Stripe payments disabled"),
    }
    if payments.providers().is_empty() {
        tracing::warn!("No payment provider configured, new bookings cannot be paid");
    }

    let registry = SessionRegistry::new(
        remote.clone(),
        Arc::new(SqliteTokenStore::new(pool.clone())),
    );
    let engine = BookingEngine::new(remote, payments, clock);

    let addr = format!("{}:{}", config.host, config.port);
    let cors = CorsLayer::new()
        .allow_origin(config.frontend_origin().parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);
    let session_idle = config.session_idle;

    let state = Arc::new(AppState {
        db: pool,
        config,
        registry,
        engine,
        started_at: Instant::now(),
    });

    // ── Background task: drop idle session contexts and expired cookies ──
    let sweep_state = state.clone();
    let session_store = SqliteStore::new(sweep_state.db.clone());
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(SESSION_SWEEP_SECS));
        loop {
            interval.tick().await;
            let evicted = sweep_state.registry.evict_idle(session_idle);
            if evicted > 0 {
                tracing::debug!("Evicted {} idle sessions", evicted);
            }
            if let Err(e) = session_store.delete_expired().await {
                tracing::warn!("Could not delete expired session records: {}", e);
            }
        }
    });

    // ── Rate limiter ──
    let rate_limiter = RateLimiter::with_defaults();

    // ── Background task: cleanup stale rate limit entries ──
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.forget_idle();
        }
    });

    let router = app(state, rate_limiter)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    tracing::info!("Booking gateway starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
