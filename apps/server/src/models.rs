use chrono::{NaiveDate, NaiveTime, Timelike};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Catalog ──

/// Service duration as the catalog sends it: either a clock string
/// (`HH:MM:SS`, optionally prefixed with a day count) or plain minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceDuration {
    Minutes(u32),
    Clock(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: Decimal,
    pub duration: ServiceDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCategory {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub services: Vec<Service>,
}

impl ServiceCategory {
    pub fn service(&self, service_id: i64) -> Option<&Service> {
        self.services.iter().find(|s| s.id == service_id)
    }
}

// ── Slots ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotReason {
    #[serde(rename = "Already booked")]
    AlreadyBooked,
    #[serde(rename = "In the past")]
    InThePast,
}

impl fmt::Display for SlotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyBooked => f.write_str("Already booked"),
            Self::InThePast => f.write_str("In the past"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub available: bool,
    pub reason: Option<SlotReason>,
}

/// The slot grid computed for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySlots {
    pub date: NaiveDate,
    pub slots: Vec<TimeSlot>,
}

impl DaySlots {
    pub fn slot(&self, time: NaiveTime) -> Option<&TimeSlot> {
        self.slots.iter().find(|s| s.time == time)
    }
}

// ── Appointments ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Rescheduled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Rescheduled => "rescheduled",
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "rescheduled" => Ok(Self::Rescheduled),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    DepositPaid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Paystack,
    Stripe,
}

impl PaymentProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paystack => "paystack",
            Self::Stripe => "stripe",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paystack" => Ok(Self::Paystack),
            "stripe" => Ok(Self::Stripe),
            other => Err(format!("unknown payment provider: {other}")),
        }
    }
}

/// A service as referenced by an appointment. The repository sometimes
/// sends full service objects and sometimes bare ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
}

impl From<&Service> for ServiceRef {
    fn from(service: &Service) -> Self {
        Self {
            id: service.id,
            name: Some(service.name.clone()),
            price: Some(service.price),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: i64,
    pub client_email: String,
    pub client_name: Option<String>,
    pub client_phone: Option<String>,
    pub services: Vec<ServiceRef>,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub total_price: Decimal,
    pub total_duration: u32,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
    pub payment_provider: Option<PaymentProvider>,
    pub payment_reference: Option<String>,
    pub deposit_amount: Option<Decimal>,
    pub remaining_amount: Option<Decimal>,
    pub notes: Option<String>,
    pub is_rescheduled: bool,
}

/// Creation payload. Only ever built from a verified payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAppointment {
    pub service_ids: Vec<i64>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub client_name: String,
    pub client_email: String,
    pub client_phone: Option<String>,
    pub notes: Option<String>,
    pub total_price: Decimal,
    pub total_duration: u32,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
    pub payment_provider: PaymentProvider,
    pub payment_reference: String,
    pub deposit_amount: Decimal,
    pub remaining_amount: Decimal,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppointmentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_ids: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AppointmentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_rescheduled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentScope {
    Own,
    All,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub full_name: String,
    pub email: String,
    pub password: String,
    pub password2: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct ChooseCategoryRequest {
    pub category_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ChooseDateRequest {
    pub date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct ChooseTimeRequest {
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub appointment_id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub provider: Option<PaymentProvider>,
}

#[derive(Debug, Deserialize)]
pub struct PaystackCallbackQuery {
    pub reference: Option<String>,
    pub trxref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StripeCallbackQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AppointmentsQuery {
    #[serde(default)]
    pub status: Option<AppointmentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: AppointmentStatus,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Parse `HH:MM` or `HH:MM:SS` into a time with seconds dropped.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    let parsed = NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S%.f"))
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()?;
    NaiveTime::from_hms_opt(parsed.hour(), parsed.minute(), 0)
}

/// Serde adapter for times of day rendered as `HH:MM`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time_of_day(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time of day: {raw}")))
    }
}

/// [`hhmm`] for optional times.
pub mod hhmm_opt {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        time: &Option<NaiveTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(time) => super::hhmm::serialize(time, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveTime>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| {
                super::parse_time_of_day(&raw)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid time of day: {raw}")))
            })
            .transpose()
    }
}
