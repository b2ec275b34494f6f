//! Engine error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::db::StorageError;
use crate::models::{ApiResponse, PaymentProvider, SlotReason};
use crate::payment::{GatewayError, VerificationFailure};
use crate::pricing::DurationError;
use crate::repository::RepositoryError;
use crate::session::AuthError;

/// Missing or inconsistent draft input. Recovered by the user correcting it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("category {0} not found")]
    UnknownCategory(i64),
    #[error("service {0} is not offered in this category")]
    UnknownService(i64),
    #[error("select at least one service")]
    NoServices,
    #[error("choose a date first")]
    DateMissing,
    #[error("choose a time first")]
    TimeMissing,
    #[error("slots for {0} are not loaded")]
    SlotsNotLoaded(NaiveDate),
    #[error("the {time} slot is unavailable: {reason}")]
    SlotUnavailable { time: NaiveTime, reason: SlotReason },
    #[error("{0} is outside the booking hours")]
    UnknownSlot(NaiveTime),
    #[error("a phone number is required")]
    PhoneRequired,
    #[error("services cannot be changed while rescheduling")]
    ServicesLocked,
    #[error("cannot {action} while in {step}")]
    InvalidTransition {
        action: &'static str,
        step: &'static str,
    },
    #[error("appointment {0} not found")]
    AppointmentNotFound(i64),
    #[error("appointment {0} cannot be rescheduled")]
    NotReschedulable(i64),
    #[error("payment provider {0} is not available")]
    ProviderUnavailable(PaymentProvider),
    #[error("no payment provider is configured")]
    NoPaymentProvider,
    /// The deposit share of `total` rounds to nothing.
    #[error("a booking total of {0} is too small to take a deposit online")]
    DepositTooSmall(Decimal),
    #[error(transparent)]
    Duration(#[from] DurationError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The slot was taken between selection and commit.
    #[error("slot no longer available: {0}")]
    AvailabilityConflict(String),

    #[error("payment could not be started with {provider}: {source}")]
    PaymentInit {
        provider: PaymentProvider,
        #[source]
        source: GatewayError,
    },

    #[error("payment verification failed: {0}")]
    PaymentVerification(#[from] VerificationFailure),

    #[error("session expired, please log in again")]
    AuthExpired,

    #[error("login required")]
    NotAuthenticated,

    #[error("admin access required")]
    Forbidden,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("repository error: {0}")]
    Repository(RepositoryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Unauthorized => Self::AuthExpired,
            RepositoryError::Conflict(detail) => Self::AvailabilityConflict(detail),
            other => Self::Repository(other),
        }
    }
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::AvailabilityConflict(_) => StatusCode::CONFLICT,
            Self::PaymentInit { .. } => StatusCode::BAD_GATEWAY,
            Self::PaymentVerification(_) => StatusCode::PAYMENT_REQUIRED,
            Self::AuthExpired | Self::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Auth(err) => err.status_code(),
            Self::Repository(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() || matches!(self, Self::PaymentVerification(_)) {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
        (status, Json(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_errors_are_classified() {
        assert!(matches!(
            EngineError::from(RepositoryError::Unauthorized),
            EngineError::AuthExpired
        ));
        assert!(matches!(
            EngineError::from(RepositoryError::Conflict("overlap".into())),
            EngineError::AvailabilityConflict(_)
        ));
        assert!(matches!(
            EngineError::from(RepositoryError::NotFound),
            EngineError::Repository(RepositoryError::NotFound)
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EngineError::from(ValidationError::PhoneRequired).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            EngineError::AvailabilityConflict("taken".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(EngineError::AuthExpired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(EngineError::Forbidden.status_code(), StatusCode::FORBIDDEN);
    }
}
