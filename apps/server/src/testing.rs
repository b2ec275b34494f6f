//! In-memory fakes and fixtures shared by the unit tests.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::booking::BookingDraft;
use crate::db::StorageError;
use crate::models::{
    Appointment, AppointmentPatch, AppointmentScope, AppointmentStatus, NewAppointment,
    PaymentProvider, PaymentStatus, RegisterRequest, Service, ServiceCategory, ServiceDuration,
    ServiceRef,
};
use crate::payment::{
    Claim, ClaimAttempt, ClaimOutcome, GatewayError, GatewayVerification, PaymentGateway,
    PaymentRedirect, PendingTransaction, TransactionStore,
};
use crate::repository::{AppointmentRepository, RepositoryError};
use crate::session::{
    AuthApi, AuthError, Identity, RefreshedTokens, SessionAuthManager, SessionId, TokenPair,
    TokenStore,
};

static TOKEN_SERIAL: AtomicU64 = AtomicU64::new(0);

/// An unsigned JWT carrying the claims the gateway reads.
pub fn mint_token(email: &str, is_admin: bool, exp: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "email": email,
        "full_name": "Test Client",
        "is_staff": is_admin,
        "exp": exp.timestamp(),
        "jti": TOKEN_SERIAL.fetch_add(1, Ordering::SeqCst),
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

fn fresh_token(email: &str) -> String {
    mint_token(email, email.starts_with("admin"), Utc::now() + Duration::minutes(5))
}

// ── Auth ──

pub struct FakeAuthApi {
    pub refresh_calls: AtomicUsize,
    delay: Option<std::time::Duration>,
    reject_refresh: bool,
    login_access: Option<String>,
    email: Mutex<String>,
    issued: Mutex<Option<String>>,
}

impl Default for FakeAuthApi {
    fn default() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            delay: None,
            reject_refresh: false,
            login_access: None,
            email: Mutex::new("ada@example.com".into()),
            issued: Mutex::new(None),
        }
    }
}

impl FakeAuthApi {
    /// Refreshes take long enough for concurrent callers to pile up.
    pub fn slow() -> Self {
        Self {
            delay: Some(std::time::Duration::from_millis(50)),
            ..Self::default()
        }
    }

    pub fn rejecting_refresh() -> Self {
        Self {
            reject_refresh: true,
            ..Self::default()
        }
    }

    pub fn with_login_access(access: &str) -> Self {
        Self {
            login_access: Some(access.to_string()),
            ..Self::default()
        }
    }

    /// The access token handed out by the last refresh.
    pub fn issued_access(&self) -> String {
        self.issued.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait]
impl AuthApi for FakeAuthApi {
    async fn login(&self, email: &str, _password: &str) -> Result<TokenPair, AuthError> {
        *self.email.lock().unwrap() = email.to_string();
        Ok(TokenPair {
            access: self
                .login_access
                .clone()
                .unwrap_or_else(|| fresh_token(email)),
            refresh: "refresh-1".into(),
        })
    }

    async fn register(&self, _profile: &RegisterRequest) -> Result<(), AuthError> {
        Ok(())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_refresh {
            return Err(AuthError::RefreshRejected);
        }
        let email = self.email.lock().unwrap().clone();
        let access = fresh_token(&email);
        *self.issued.lock().unwrap() = Some(access.clone());
        Ok(RefreshedTokens {
            access,
            refresh: None,
        })
    }

    async fn verify_email(&self, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<SessionId, TokenPair>>,
}

impl MemoryTokenStore {
    pub fn insert(&self, session: &SessionId, tokens: TokenPair) {
        self.tokens.lock().unwrap().insert(session.clone(), tokens);
    }

    pub fn get(&self, session: &SessionId) -> Option<TokenPair> {
        self.tokens.lock().unwrap().get(session).cloned()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self, session: &SessionId) -> Result<Option<TokenPair>, StorageError> {
        Ok(self.get(session))
    }

    async fn save(&self, session: &SessionId, tokens: &TokenPair) -> Result<(), StorageError> {
        self.insert(session, tokens.clone());
        Ok(())
    }

    async fn clear(&self, session: &SessionId) -> Result<(), StorageError> {
        self.tokens.lock().unwrap().remove(session);
        Ok(())
    }
}

/// A manager logged in as `ada@example.com`.
pub async fn authenticated_manager(session: &SessionId) -> SessionAuthManager {
    let auth = SessionAuthManager::new(
        session.clone(),
        Arc::new(FakeAuthApi::default()),
        Arc::new(MemoryTokenStore::default()),
    );
    auth.login("ada@example.com", "pw").await.unwrap();
    auth
}

// ── Payments ──

#[derive(Default)]
pub struct MemoryTransactionStore {
    pending: Mutex<HashMap<SessionId, PendingTransaction>>,
    claims: Mutex<HashMap<String, Claim>>,
}

impl MemoryTransactionStore {
    pub fn claim(&self, correlation_id: &str) -> Option<Claim> {
        self.claims.lock().unwrap().get(correlation_id).cloned()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn put_pending(&self, tx: &PendingTransaction) -> Result<(), StorageError> {
        self.pending
            .lock()
            .unwrap()
            .insert(tx.session_id.clone(), tx.clone());
        Ok(())
    }

    async fn pending(
        &self,
        session: &SessionId,
    ) -> Result<Option<PendingTransaction>, StorageError> {
        Ok(self.pending.lock().unwrap().get(session).cloned())
    }

    async fn clear_pending(
        &self,
        session: &SessionId,
        correlation_id: &str,
    ) -> Result<(), StorageError> {
        let mut pending = self.pending.lock().unwrap();
        if pending
            .get(session)
            .is_some_and(|tx| tx.correlation_id == correlation_id)
        {
            pending.remove(session);
        }
        Ok(())
    }

    async fn claim(&self, correlation_id: &str) -> Result<Option<Claim>, StorageError> {
        Ok(MemoryTransactionStore::claim(self, correlation_id))
    }

    async fn try_claim(
        &self,
        correlation_id: &str,
        session: &SessionId,
        provider: PaymentProvider,
    ) -> Result<ClaimAttempt, StorageError> {
        let mut claims = self.claims.lock().unwrap();
        if let Some(existing) = claims.get(correlation_id) {
            return Ok(ClaimAttempt::AlreadyClaimed(existing.clone()));
        }
        claims.insert(
            correlation_id.to_string(),
            Claim {
                correlation_id: correlation_id.to_string(),
                session_id: session.clone(),
                provider,
                outcome: ClaimOutcome::InProgress,
                appointment_id: None,
                detail: None,
            },
        );
        Ok(ClaimAttempt::Acquired)
    }

    async fn settle(
        &self,
        correlation_id: &str,
        outcome: ClaimOutcome,
        appointment_id: Option<i64>,
        detail: Option<&str>,
    ) -> Result<(), StorageError> {
        if let Some(claim) = self.claims.lock().unwrap().get_mut(correlation_id) {
            claim.outcome = outcome;
            claim.appointment_id = appointment_id;
            claim.detail = detail.map(str::to_string);
        }
        Ok(())
    }
}

pub struct FakeGateway {
    provider: PaymentProvider,
    initialized: Mutex<Vec<(String, Decimal)>>,
    pub verify_calls: AtomicUsize,
    pub paid: AtomicBool,
    pub fail_initialize: AtomicBool,
    /// Held by a test to stall `verify` until released.
    pub verify_gate: tokio::sync::Mutex<()>,
}

impl FakeGateway {
    pub fn new(provider: PaymentProvider) -> Self {
        Self {
            provider,
            initialized: Mutex::new(Vec::new()),
            verify_calls: AtomicUsize::new(0),
            paid: AtomicBool::new(true),
            fail_initialize: AtomicBool::new(false),
            verify_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// `(email, amount)` of every initialize call.
    pub fn initialized(&self) -> Vec<(String, Decimal)> {
        self.initialized.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn provider(&self) -> PaymentProvider {
        self.provider
    }

    async fn initialize(
        &self,
        email: &str,
        amount: Decimal,
    ) -> Result<PaymentRedirect, GatewayError> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 503,
                message: "gateway down".into(),
            });
        }
        let mut initialized = self.initialized.lock().unwrap();
        initialized.push((email.to_string(), amount));
        let correlation_id = format!("{}-ref-{}", self.provider, initialized.len());
        Ok(PaymentRedirect {
            provider: self.provider,
            redirect_url: format!("https://pay.example.com/{correlation_id}"),
            correlation_id,
        })
    }

    async fn verify(&self, correlation_id: &str) -> Result<GatewayVerification, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let paid = self.paid.load(Ordering::SeqCst);
        let _gate = self.verify_gate.lock().await;
        Ok(GatewayVerification {
            correlation_id: correlation_id.to_string(),
            paid,
            status: if paid { "success" } else { "abandoned" }.into(),
        })
    }
}

// ── Repository ──

pub struct FakeRepository {
    categories: Vec<ServiceCategory>,
    booked: Mutex<Vec<NaiveTime>>,
    appointments: Mutex<Vec<Appointment>>,
    created: Mutex<Vec<NewAppointment>>,
    updates: Mutex<Vec<(i64, AppointmentPatch)>>,
    deleted: Mutex<Vec<i64>>,
    pub conflict_on_create: AtomicBool,
}

impl Default for FakeRepository {
    fn default() -> Self {
        Self {
            categories: vec![coloring_category()],
            booked: Mutex::new(Vec::new()),
            appointments: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            conflict_on_create: AtomicBool::new(false),
        }
    }
}

impl FakeRepository {
    pub fn insert(&self, appointment: Appointment) {
        self.appointments.lock().unwrap().push(appointment);
    }

    /// Mark `time` as taken on every date.
    pub fn book(&self, time: NaiveTime) {
        self.booked.lock().unwrap().push(time);
    }

    pub fn created(&self) -> Vec<NewAppointment> {
        self.created.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(i64, AppointmentPatch)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<i64> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl AppointmentRepository for FakeRepository {
    async fn list_categories(&self) -> Result<Vec<ServiceCategory>, RepositoryError> {
        Ok(self.categories.clone())
    }

    async fn list_booked_times(
        &self,
        _token: &str,
        _date: NaiveDate,
    ) -> Result<Vec<NaiveTime>, RepositoryError> {
        Ok(self.booked.lock().unwrap().clone())
    }

    async fn create_appointment(
        &self,
        _token: &str,
        new: &NewAppointment,
    ) -> Result<Appointment, RepositoryError> {
        if self.conflict_on_create.load(Ordering::SeqCst) {
            return Err(RepositoryError::Conflict(
                "This time slot overlaps an existing appointment".into(),
            ));
        }
        let mut created = self.created.lock().unwrap();
        created.push(new.clone());
        let appointment = Appointment {
            id: 100 + created.len() as i64,
            client_email: new.client_email.clone(),
            client_name: Some(new.client_name.clone()),
            client_phone: new.client_phone.clone(),
            services: new
                .service_ids
                .iter()
                .map(|&id| ServiceRef {
                    id,
                    name: None,
                    price: None,
                })
                .collect(),
            date: new.date,
            time: new.time,
            total_price: new.total_price,
            total_duration: new.total_duration,
            status: new.status,
            payment_status: new.payment_status,
            payment_provider: Some(new.payment_provider),
            payment_reference: Some(new.payment_reference.clone()),
            deposit_amount: Some(new.deposit_amount),
            remaining_amount: Some(new.remaining_amount),
            notes: new.notes.clone(),
            is_rescheduled: false,
        };
        self.appointments.lock().unwrap().push(appointment.clone());
        Ok(appointment)
    }

    async fn update_appointment(
        &self,
        _token: &str,
        id: i64,
        patch: &AppointmentPatch,
    ) -> Result<Appointment, RepositoryError> {
        self.updates.lock().unwrap().push((id, patch.clone()));
        let mut appointments = self.appointments.lock().unwrap();
        let appointment = appointments
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(RepositoryError::NotFound)?;
        if let Some(date) = patch.date {
            appointment.date = date;
        }
        if let Some(time) = patch.time {
            appointment.time = time;
        }
        if let Some(status) = patch.status {
            appointment.status = status;
        }
        if let Some(flag) = patch.is_rescheduled {
            appointment.is_rescheduled = flag;
        }
        Ok(appointment.clone())
    }

    async fn list_appointments(
        &self,
        _token: &str,
        _scope: AppointmentScope,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        Ok(self.appointments.lock().unwrap().clone())
    }

    async fn delete_appointment(&self, _token: &str, id: i64) -> Result<(), RepositoryError> {
        let mut appointments = self.appointments.lock().unwrap();
        let before = appointments.len();
        appointments.retain(|a| a.id != id);
        if appointments.len() == before {
            return Err(RepositoryError::NotFound);
        }
        self.deleted.lock().unwrap().push(id);
        Ok(())
    }
}

// ── Fixtures ──

fn service(id: i64, name: &str, price: i64, duration: &str) -> Service {
    Service {
        id,
        name: name.into(),
        description: None,
        price: Decimal::from(price),
        duration: ServiceDuration::Clock(duration.into()),
    }
}

/// Category 1 with a 40/30min and a 60/60min service.
pub fn coloring_category() -> ServiceCategory {
    ServiceCategory {
        id: 1,
        name: "Coloring".into(),
        description: None,
        slug: Some("coloring".into()),
        services: vec![
            service(1, "Root touch-up", 40, "00:30:00"),
            service(2, "Gloss", 60, "01:00:00"),
        ],
    }
}

fn fixture_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 5, 1).unwrap()
}

fn fixture_time() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap()
}

pub fn identity(is_admin: bool) -> Identity {
    Identity {
        email: "ada@example.com".into(),
        full_name: "Test Client".into(),
        is_admin,
        phone: None,
    }
}

/// Both coloring services on 2030-05-01 at 10:00, total 100.
pub fn sample_draft() -> BookingDraft {
    let category = coloring_category();
    BookingDraft {
        services: category.services.iter().map(ServiceRef::from).collect(),
        date: fixture_date(),
        time: fixture_time(),
        client_name: "Test Client".into(),
        client_email: "ada@example.com".into(),
        client_phone: Some("0800".into()),
        notes: None,
        reschedule_id: None,
        total_price: Decimal::from(100),
        total_duration: 90,
    }
}

pub fn confirmed_appointment(id: i64) -> Appointment {
    Appointment {
        id,
        client_email: "ada@example.com".into(),
        client_name: Some("Test Client".into()),
        client_phone: Some("0800".into()),
        services: coloring_category()
            .services
            .iter()
            .map(ServiceRef::from)
            .collect(),
        date: fixture_date(),
        time: fixture_time(),
        total_price: Decimal::from(100),
        total_duration: 90,
        status: AppointmentStatus::Confirmed,
        payment_status: PaymentStatus::DepositPaid,
        payment_provider: Some(PaymentProvider::Paystack),
        payment_reference: Some(format!("ref-{id}")),
        deposit_amount: Some(Decimal::from(20)),
        remaining_amount: Some(Decimal::from(80)),
        notes: None,
        is_rescheduled: false,
    }
}
