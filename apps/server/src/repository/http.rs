//! REST client for the remote appointment store and its auth endpoints.
//!
//! The store has grown several spellings for the same fields over time
//! (camelCase aliases, services as objects or ids, durations as clock
//! strings or seconds). Everything is normalized here so the engine only
//! ever sees [`Appointment`].

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{AppointmentRepository, RepositoryError};
use crate::models::{
    parse_time_of_day, Appointment, AppointmentPatch, AppointmentScope, AppointmentStatus,
    NewAppointment, PaymentProvider, PaymentStatus, RegisterRequest, ServiceCategory,
    ServiceDuration, ServiceRef,
};
use crate::pricing::normalized_minutes;
use crate::session::{AuthApi, AuthError, RefreshedTokens, TokenPair};

#[derive(Debug, Clone)]
pub struct RemoteApi {
    http: reqwest::Client,
    base: Url,
}

impl RemoteApi {
    pub fn new(http: reqwest::Client, mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { http, base }
    }

    fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base.join(path)
    }
}

// ── Wire shapes ──

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireServiceRef {
    Full {
        id: i64,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        price: Option<Decimal>,
    },
    Id(i64),
}

impl From<WireServiceRef> for ServiceRef {
    fn from(wire: WireServiceRef) -> Self {
        match wire {
            WireServiceRef::Full { id, name, price } => ServiceRef { id, name, price },
            WireServiceRef::Id(id) => ServiceRef {
                id,
                name: None,
                price: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireServices {
    Many(Vec<WireServiceRef>),
    One(WireServiceRef),
}

impl WireServices {
    fn into_refs(self) -> Vec<ServiceRef> {
        match self {
            Self::Many(refs) => refs.into_iter().map(ServiceRef::from).collect(),
            Self::One(single) => vec![single.into()],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Minutes(u32),
    Text(String),
}

impl WireDuration {
    /// Integers are minutes. Strings are either a clock (`[D ]HH:MM:SS`) or
    /// a bare seconds count as some serializers render durations.
    fn minutes(&self) -> Option<u32> {
        match self {
            Self::Minutes(minutes) => Some(*minutes),
            Self::Text(raw) => normalized_minutes(&ServiceDuration::Clock(raw.clone()))
                .ok()
                .or_else(|| {
                    let seconds: f64 = raw.trim().parse().ok()?;
                    (seconds >= 0.0).then(|| (seconds / 60.0).round() as u32)
                }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireAppointment {
    id: i64,
    #[serde(default, alias = "clientEmail", alias = "email")]
    client_email: Option<String>,
    #[serde(default, alias = "clientName")]
    client_name: Option<String>,
    #[serde(default, alias = "clientPhone", alias = "phone")]
    client_phone: Option<String>,
    #[serde(default)]
    services: Option<WireServices>,
    #[serde(default)]
    service_ids: Option<WireServices>,
    #[serde(default)]
    service: Option<WireServices>,
    #[serde(alias = "date")]
    appointment_date: NaiveDate,
    #[serde(alias = "time")]
    appointment_time: String,
    #[serde(default, alias = "totalPrice")]
    total_price: Option<Decimal>,
    #[serde(default, alias = "totalDuration")]
    total_duration: Option<WireDuration>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    is_cancelled: bool,
    #[serde(default)]
    is_paid: bool,
    #[serde(default, alias = "paymentStatus")]
    payment_status: Option<String>,
    #[serde(default, alias = "paymentProvider")]
    payment_provider: Option<String>,
    #[serde(default, alias = "paymentReference")]
    payment_reference: Option<String>,
    #[serde(default, alias = "depositAmount")]
    deposit_amount: Option<Decimal>,
    #[serde(default, alias = "remainingAmount")]
    remaining_amount: Option<Decimal>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default, alias = "isRescheduled")]
    is_rescheduled: bool,
}

impl WireAppointment {
    fn into_appointment(self) -> Result<Appointment, RepositoryError> {
        let time = parse_time_of_day(&self.appointment_time).ok_or_else(|| {
            RepositoryError::Malformed(format!(
                "appointment {} has time {:?}",
                self.id, self.appointment_time
            ))
        })?;

        let services = self
            .services
            .or(self.service_ids)
            .or(self.service)
            .map(WireServices::into_refs)
            .unwrap_or_default();

        let total_duration = match &self.total_duration {
            Some(raw) => raw.minutes().unwrap_or_else(|| {
                tracing::debug!("Appointment {} has unreadable duration {:?}", self.id, raw);
                0
            }),
            None => 0,
        };

        let status = if self.is_cancelled {
            AppointmentStatus::Cancelled
        } else {
            self.status
                .as_deref()
                .and_then(|s| s.to_ascii_lowercase().parse().ok())
                .unwrap_or(AppointmentStatus::Pending)
        };

        let payment_status = match self.payment_status.as_deref() {
            Some("deposit_paid") | Some("paid") => PaymentStatus::DepositPaid,
            _ if self.is_paid => PaymentStatus::DepositPaid,
            _ => PaymentStatus::Unpaid,
        };

        Ok(Appointment {
            id: self.id,
            client_email: self.client_email.unwrap_or_default(),
            client_name: self.client_name.filter(|n| !n.is_empty()),
            client_phone: self.client_phone.filter(|p| !p.is_empty()),
            services,
            date: self.appointment_date,
            time,
            total_price: self.total_price.unwrap_or_default(),
            total_duration,
            status,
            payment_status,
            payment_provider: self
                .payment_provider
                .as_deref()
                .and_then(|p| p.to_ascii_lowercase().parse::<PaymentProvider>().ok()),
            payment_reference: self.payment_reference.filter(|r| !r.is_empty()),
            deposit_amount: self.deposit_amount,
            remaining_amount: self.remaining_amount,
            notes: self.notes.filter(|n| !n.is_empty()),
            is_rescheduled: self.is_rescheduled,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BookedSlotsResponse {
    #[serde(default)]
    booked: Vec<String>,
}

#[derive(Serialize)]
struct CreatePayload<'a> {
    services: &'a [i64],
    appointment_date: NaiveDate,
    appointment_time: String,
    client_name: &'a str,
    client_email: &'a str,
    client_phone: Option<&'a str>,
    notes: Option<&'a str>,
    status: &'static str,
    is_paid: bool,
    payment_reference: &'a str,
    #[serde(rename = "paymentStatus")]
    payment_status: PaymentStatus,
    #[serde(rename = "paymentProvider")]
    payment_provider: PaymentProvider,
    #[serde(rename = "depositAmount")]
    deposit_amount: Decimal,
    #[serde(rename = "remainingAmount")]
    remaining_amount: Decimal,
    #[serde(rename = "totalPrice")]
    total_price: Decimal,
    #[serde(rename = "totalDuration")]
    total_duration: u32,
}

impl<'a> From<&'a NewAppointment> for CreatePayload<'a> {
    fn from(new: &'a NewAppointment) -> Self {
        Self {
            services: &new.service_ids,
            appointment_date: new.date,
            appointment_time: new.time.format("%H:%M").to_string(),
            client_name: &new.client_name,
            client_email: &new.client_email,
            client_phone: new.client_phone.as_deref(),
            notes: new.notes.as_deref(),
            status: new.status.as_str(),
            is_paid: new.payment_status == PaymentStatus::DepositPaid,
            payment_reference: &new.payment_reference,
            payment_status: new.payment_status,
            payment_provider: new.payment_provider,
            deposit_amount: new.deposit_amount,
            remaining_amount: new.remaining_amount,
            total_price: new.total_price,
            total_duration: new.total_duration,
        }
    }
}

#[derive(Serialize)]
struct PatchPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    appointment_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    appointment_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    services: Option<&'a [i64]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_cancelled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_rescheduled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_phone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
}

impl<'a> From<&'a AppointmentPatch> for PatchPayload<'a> {
    fn from(patch: &'a AppointmentPatch) -> Self {
        Self {
            appointment_date: patch.date,
            appointment_time: patch.time.map(|t| t.format("%H:%M").to_string()),
            services: patch.service_ids.as_deref(),
            status: patch.status.map(AppointmentStatus::as_str),
            is_cancelled: patch
                .status
                .filter(|s| *s == AppointmentStatus::Cancelled)
                .map(|_| true),
            is_rescheduled: patch.is_rescheduled,
            client_phone: patch.client_phone.as_deref(),
            notes: patch.notes.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LoginResponse {
    Nested { tokens: TokenPair },
    Flat(TokenPair),
}

// ── Response handling ──

fn mentions_conflict(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("overlap") || lower.contains("already booked")
}

/// Best human-readable message in an error body: `detail`, `message` or
/// `error`, else the first field error, else the raw text.
fn error_message(body: &str) -> Option<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        let trimmed = body.trim();
        return (!trimmed.is_empty() && trimmed.len() <= 200).then(|| trimmed.to_string());
    };

    let object = value.as_object()?;
    for key in ["detail", "message", "error"] {
        if let Some(text) = object.get(key).and_then(|v| v.as_str()) {
            return Some(text.to_string());
        }
    }
    object.iter().find_map(|(field, errors)| {
        let first = match errors {
            serde_json::Value::Array(items) => items.first()?.as_str()?,
            serde_json::Value::String(text) => text.as_str(),
            _ => return None,
        };
        Some(if field == "non_field_errors" {
            first.to_string()
        } else {
            format!("{field}: {first}")
        })
    })
}

fn classify(status: StatusCode, body: String) -> RepositoryError {
    match status {
        StatusCode::UNAUTHORIZED => RepositoryError::Unauthorized,
        StatusCode::NOT_FOUND => RepositoryError::NotFound,
        StatusCode::CONFLICT => RepositoryError::Conflict(
            error_message(&body).unwrap_or_else(|| "time slot already booked".into()),
        ),
        StatusCode::BAD_REQUEST if mentions_conflict(&body) => RepositoryError::Conflict(
            error_message(&body).unwrap_or_else(|| "time slot already booked".into()),
        ),
        _ => RepositoryError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, RepositoryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify(status, body))
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, RepositoryError> {
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| RepositoryError::Malformed(e.to_string()))
}

async fn auth_failure(resp: reqwest::Response) -> AuthError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    AuthError::Rejected {
        status,
        message: error_message(&body).unwrap_or_else(|| format!("request failed with {status}")),
    }
}

// ── Repository ──

#[async_trait]
impl AppointmentRepository for RemoteApi {
    async fn list_categories(&self) -> Result<Vec<ServiceCategory>, RepositoryError> {
        let resp = self.http.get(self.endpoint("categories/")?).send().await?;
        decode(check(resp).await?).await
    }

    async fn list_booked_times(
        &self,
        token: &str,
        date: NaiveDate,
    ) -> Result<Vec<NaiveTime>, RepositoryError> {
        let mut url = self.endpoint("appointments/booked-slots/")?;
        url.query_pairs_mut()
            .append_pair("date", &date.format("%Y-%m-%d").to_string());

        let resp = self.http.get(url).bearer_auth(token).send().await?;
        let body: BookedSlotsResponse = decode(check(resp).await?).await?;

        Ok(body
            .booked
            .iter()
            .filter_map(|raw| {
                let parsed = parse_time_of_day(raw);
                if parsed.is_none() {
                    tracing::warn!("Ignoring unreadable booked time {:?} on {}", raw, date);
                }
                parsed
            })
            .collect())
    }

    async fn create_appointment(
        &self,
        token: &str,
        appointment: &NewAppointment,
    ) -> Result<Appointment, RepositoryError> {
        let resp = self
            .http
            .post(self.endpoint("appointments/")?)
            .bearer_auth(token)
            .json(&CreatePayload::from(appointment))
            .send()
            .await?;
        let wire: WireAppointment = decode(check(resp).await?).await?;
        wire.into_appointment()
    }

    async fn update_appointment(
        &self,
        token: &str,
        id: i64,
        patch: &AppointmentPatch,
    ) -> Result<Appointment, RepositoryError> {
        // Reschedules go through the dedicated endpoint, which re-validates
        // the new slot.
        let path = if patch.is_rescheduled == Some(true) {
            format!("appointments/{id}/update/")
        } else {
            format!("appointments/{id}/")
        };

        let resp = self
            .http
            .patch(self.endpoint(&path)?)
            .bearer_auth(token)
            .json(&PatchPayload::from(patch))
            .send()
            .await?;
        let wire: WireAppointment = decode(check(resp).await?).await?;
        wire.into_appointment()
    }

    async fn list_appointments(
        &self,
        token: &str,
        scope: AppointmentScope,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        let path = match scope {
            AppointmentScope::Own => "appointments/my/",
            AppointmentScope::All => "appointments/admin/",
        };
        let resp = self
            .http
            .get(self.endpoint(path)?)
            .bearer_auth(token)
            .send()
            .await?;
        let wire: Vec<WireAppointment> = decode(check(resp).await?).await?;
        wire.into_iter().map(WireAppointment::into_appointment).collect()
    }

    async fn delete_appointment(&self, token: &str, id: i64) -> Result<(), RepositoryError> {
        let resp = self
            .http
            .delete(self.endpoint(&format!("appointments/{id}/"))?)
            .bearer_auth(token)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

// ── Auth ──

#[async_trait]
impl AuthApi for RemoteApi {
    async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        let url = self
            .endpoint("auth/login/")
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::InvalidCredentials(
                error_message(&body).unwrap_or_else(|| "invalid email or password".into()),
            ));
        }
        if !status.is_success() {
            return Err(auth_failure(resp).await);
        }

        let text = resp.text().await?;
        match serde_json::from_str::<LoginResponse>(&text) {
            Ok(LoginResponse::Nested { tokens }) | Ok(LoginResponse::Flat(tokens)) => Ok(tokens),
            Err(e) => Err(AuthError::Malformed(e.to_string())),
        }
    }

    async fn register(&self, profile: &RegisterRequest) -> Result<(), AuthError> {
        let url = self
            .endpoint("auth/register/")
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let resp = self.http.post(url).json(profile).send().await?;
        if !resp.status().is_success() {
            return Err(auth_failure(resp).await);
        }
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
        let url = self
            .endpoint("auth/token/refresh/")
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "refresh": refresh_token }))
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(AuthError::RefreshRejected);
        }
        if !status.is_success() {
            return Err(auth_failure(resp).await);
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| AuthError::Malformed(e.to_string()))
    }

    async fn verify_email(&self, token: &str) -> Result<(), AuthError> {
        let mut url = self
            .endpoint("auth/email-verify/")
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", token);

        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(auth_failure(resp).await);
        }
        Ok(())
    }
}
