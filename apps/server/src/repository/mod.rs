//! The remote appointment store, seen from the engine.
//!
//! The store is the only place appointments are created or mutated. It is
//! expected to reject a conflicting creation atomically; such a rejection
//! surfaces as [`RepositoryError::Conflict`].

pub mod http;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

use crate::models::{
    Appointment, AppointmentPatch, AppointmentScope, NewAppointment, ServiceCategory,
};

pub use http::RemoteApi;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The bearer token was rejected; callers refresh once and retry.
    #[error("access token rejected")]
    Unauthorized,
    /// The store refused the write because the slot is taken.
    #[error("{0}")]
    Conflict(String),
    #[error("not found")]
    NotFound,
    #[error("repository returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed repository response: {0}")]
    Malformed(String),
    #[error("invalid repository endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

#[async_trait]
pub trait AppointmentRepository: Send + Sync {
    async fn list_categories(&self) -> Result<Vec<ServiceCategory>, RepositoryError>;

    /// Start times already taken on `date`, seconds dropped.
    async fn list_booked_times(
        &self,
        token: &str,
        date: NaiveDate,
    ) -> Result<Vec<NaiveTime>, RepositoryError>;

    async fn create_appointment(
        &self,
        token: &str,
        appointment: &NewAppointment,
    ) -> Result<Appointment, RepositoryError>;

    async fn update_appointment(
        &self,
        token: &str,
        id: i64,
        patch: &AppointmentPatch,
    ) -> Result<Appointment, RepositoryError>;

    async fn list_appointments(
        &self,
        token: &str,
        scope: AppointmentScope,
    ) -> Result<Vec<Appointment>, RepositoryError>;

    async fn delete_appointment(&self, token: &str, id: i64) -> Result<(), RepositoryError>;
}
