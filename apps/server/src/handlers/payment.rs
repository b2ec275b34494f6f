use axum::{
    extract::{Query, State},
    response::Redirect,
};
use std::sync::Arc;
use tower_sessions::Session;

use super::resolve_session;
use crate::booking::PaymentReturn;
use crate::error::EngineError;
use crate::models::{PaymentProvider, PaystackCallbackQuery, StripeCallbackQuery};
use crate::payment::ClaimOutcome;
use crate::AppState;

/// Where the browser goes after a payment return trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Landing {
    Confirmed(&'static str),
    Pending(&'static str),
    Failed,
    Conflict,
}

impl Landing {
    fn from_result(result: Result<PaymentReturn, EngineError>) -> Self {
        match result {
            Ok(PaymentReturn::Confirmed { destination, .. }) => Self::Confirmed(destination.path()),
            Ok(PaymentReturn::AlreadyProcessed { claim, destination }) => match claim.outcome {
                ClaimOutcome::Succeeded => Self::Confirmed(destination.path()),
                ClaimOutcome::InProgress => Self::Pending(destination.path()),
                ClaimOutcome::Failed => Self::Failed,
            },
            Err(EngineError::AvailabilityConflict(_)) => Self::Conflict,
            Err(_) => Self::Failed,
        }
    }

    fn url(self, state: &AppState) -> String {
        let config = &state.config;
        match self {
            Self::Confirmed(path) => config.frontend_link(path, Some("booking=confirmed")),
            Self::Pending(path) => config.frontend_link(path, Some("booking=pending")),
            Self::Failed => config.frontend_link("/booking", Some("payment=failed")),
            Self::Conflict => config.frontend_link("/booking", Some("payment=conflict")),
        }
    }
}

async fn land(
    state: &AppState,
    session: &Session,
    provider: PaymentProvider,
    correlation_id: Option<String>,
) -> Redirect {
    let Some(correlation_id) = correlation_id.filter(|id| !id.trim().is_empty()) else {
        tracing::warn!("{} callback without a transaction reference", provider);
        return Redirect::to(&Landing::Failed.url(state));
    };
    let Some(ctx) = resolve_session(state, session).await else {
        tracing::warn!(
            "{} callback for {} without a valid session",
            provider,
            correlation_id
        );
        return Redirect::to(&Landing::Failed.url(state));
    };

    let result = state
        .engine
        .complete_payment(&ctx, provider, correlation_id.trim())
        .await;
    if let Err(e) = &result {
        tracing::warn!(
            "{} payment {} for session {} not completed: {}",
            provider,
            correlation_id,
            ctx.id,
            e
        );
    }
    Redirect::to(&Landing::from_result(result).url(state))
}

/// GET /api/payments/paystack/callback?reference=
pub async fn paystack_callback(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(query): Query<PaystackCallbackQuery>,
) -> Redirect {
    let reference = query.reference.or(query.trxref);
    land(&state, &session, PaymentProvider::Paystack, reference).await
}

/// GET /api/payments/stripe/callback?session_id=
pub async fn stripe_callback(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(query): Query<StripeCallbackQuery>,
) -> Redirect {
    land(&state, &session, PaymentProvider::Stripe, query.session_id).await
}
