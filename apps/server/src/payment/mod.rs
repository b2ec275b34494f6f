//! Deposit payments that leave the process and come back.
//!
//! `initialize` persists a pending transaction before the user is sent to
//! the gateway; `verify` runs when they return. Verification is guarded by a
//! durable claim on the correlation id, so a replayed callback (refresh,
//! back button, duplicate delivery) never creates a second appointment.

pub mod paystack;
pub mod stripe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::booking::BookingDraft;
use crate::db::StorageError;
use crate::error::{EngineError, ValidationError};
use crate::models::{Appointment, PaymentProvider};
use crate::pricing::DepositSplit;
use crate::repository::AppointmentRepository;
use crate::session::{Identity, SessionAuthManager, SessionId};

pub use paystack::PaystackGateway;
pub use stripe::StripeGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway returned {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected gateway response: {0}")]
    Malformed(String),
    #[error("amount {0} cannot be charged")]
    InvalidAmount(Decimal),
    #[error("invalid gateway endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum VerificationFailure {
    #[error("no pending payment for this session")]
    NoPendingTransaction,
    #[error("returned payment {received} does not match pending payment {expected}")]
    Mismatch { expected: String, received: String },
    #[error("pending payment {correlation_id} is unreadable: {detail}")]
    CorruptDraft {
        correlation_id: String,
        detail: String,
    },
    #[error("payment {correlation_id} was not completed (status {status})")]
    NotPaid {
        correlation_id: String,
        status: String,
    },
    #[error("payment {correlation_id} could not be checked: {source}")]
    Gateway {
        correlation_id: String,
        #[source]
        source: GatewayError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRedirect {
    pub provider: PaymentProvider,
    pub redirect_url: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayVerification {
    pub correlation_id: String,
    pub paid: bool,
    /// Provider-specific status text, kept for diagnostics.
    pub status: String,
}

/// One external payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    /// Start a payment of `amount` whole currency units.
    async fn initialize(&self, email: &str, amount: Decimal)
        -> Result<PaymentRedirect, GatewayError>;

    async fn verify(&self, correlation_id: &str) -> Result<GatewayVerification, GatewayError>;
}

/// The cross-redirect record. At most one per session.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransaction {
    pub session_id: SessionId,
    pub correlation_id: String,
    pub provider: PaymentProvider,
    /// Serialized [`BookingDraft`]; only decoded on return.
    pub draft_json: String,
    pub deposit: Decimal,
    pub remaining: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    InProgress,
    Succeeded,
    Failed,
}

impl ClaimOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ClaimOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown claim outcome: {other}")),
        }
    }
}

/// A processed (or in-flight) verification of one correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub correlation_id: String,
    pub session_id: SessionId,
    pub provider: PaymentProvider,
    pub outcome: ClaimOutcome,
    pub appointment_id: Option<i64>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    Acquired,
    AlreadyClaimed(Claim),
}

/// Durable storage for pending transactions and verification claims.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Store `tx`, replacing any earlier transaction of the same session.
    async fn put_pending(&self, tx: &PendingTransaction) -> Result<(), StorageError>;

    async fn pending(&self, session: &SessionId)
        -> Result<Option<PendingTransaction>, StorageError>;

    /// Drop the session's pending transaction if it is still `correlation_id`.
    /// A newer transaction of the same session is left alone.
    async fn clear_pending(
        &self,
        session: &SessionId,
        correlation_id: &str,
    ) -> Result<(), StorageError>;

    async fn claim(&self, correlation_id: &str) -> Result<Option<Claim>, StorageError>;

    /// Atomically claim `correlation_id`. Only the first caller ever gets
    /// [`ClaimAttempt::Acquired`].
    async fn try_claim(
        &self,
        correlation_id: &str,
        session: &SessionId,
        provider: PaymentProvider,
    ) -> Result<ClaimAttempt, StorageError>;

    async fn settle(
        &self,
        correlation_id: &str,
        outcome: ClaimOutcome,
        appointment_id: Option<i64>,
        detail: Option<&str>,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Confirmed(Appointment),
    /// The correlation id was verified before; nothing was done.
    AlreadyProcessed(Claim),
}

pub struct PaymentProtocol {
    gateways: BTreeMap<PaymentProvider, Arc<dyn PaymentGateway>>,
    store: Arc<dyn TransactionStore>,
}

impl PaymentProtocol {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self {
            gateways: BTreeMap::new(),
            store,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.provider(), gateway);
        self
    }

    pub fn providers(&self) -> Vec<PaymentProvider> {
        self.gateways.keys().copied().collect()
    }

    /// The provider used when the client does not pick one.
    pub fn default_provider(&self) -> Option<PaymentProvider> {
        self.gateways.keys().next().copied()
    }

    fn gateway(&self, provider: PaymentProvider) -> Result<&Arc<dyn PaymentGateway>, EngineError> {
        self.gateways
            .get(&provider)
            .ok_or_else(|| ValidationError::ProviderUnavailable(provider).into())
    }

    /// Start the deposit payment for `draft` and persist the pending
    /// transaction. Nothing is persisted when the gateway fails.
    pub async fn initialize(
        &self,
        session: &SessionId,
        identity: &Identity,
        draft: &BookingDraft,
        provider: PaymentProvider,
    ) -> Result<PaymentRedirect, EngineError> {
        let gateway = self.gateway(provider)?;
        let split = DepositSplit::from_total(draft.total_price);
        if split.deposit <= Decimal::ZERO {
            return Err(ValidationError::DepositTooSmall(draft.total_price).into());
        }

        let redirect = gateway
            .initialize(&identity.email, split.deposit)
            .await
            .map_err(|source| EngineError::PaymentInit { provider, source })?;

        let draft_json = serde_json::to_string(draft)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        self.store
            .put_pending(&PendingTransaction {
                session_id: session.clone(),
                correlation_id: redirect.correlation_id.clone(),
                provider,
                draft_json,
                deposit: split.deposit,
                remaining: split.remaining,
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            "Payment {} started with {} for session {} (deposit {}, remaining {})",
            redirect.correlation_id,
            provider,
            session,
            split.deposit,
            split.remaining
        );
        Ok(redirect)
    }

    /// Verify a returning payment and create the appointment on success.
    /// Safe to call any number of times for the same correlation id.
    pub async fn verify(
        &self,
        session: &SessionId,
        auth: &SessionAuthManager,
        repo: &dyn AppointmentRepository,
        provider: PaymentProvider,
        correlation_id: &str,
    ) -> Result<VerifyOutcome, EngineError> {
        // Only the session's own pending payment may take the claim.
        let pending = match self.store.pending(session).await? {
            Some(p) if p.correlation_id == correlation_id && p.provider == provider => p,
            other => {
                if let Some(claim) = self
                    .store
                    .claim(correlation_id)
                    .await?
                    .filter(|c| c.session_id == *session)
                {
                    return Ok(VerifyOutcome::AlreadyProcessed(claim));
                }
                return Err(match other {
                    None => VerificationFailure::NoPendingTransaction,
                    Some(p) => VerificationFailure::Mismatch {
                        expected: format!("{} ({})", p.correlation_id, p.provider),
                        received: format!("{correlation_id} ({provider})"),
                    },
                }
                .into());
            }
        };

        if let ClaimAttempt::AlreadyClaimed(claim) = self
            .store
            .try_claim(correlation_id, session, provider)
            .await?
        {
            tracing::info!(
                "Payment {} already processed ({}), ignoring repeat callback",
                correlation_id,
                claim.outcome
            );
            return Ok(VerifyOutcome::AlreadyProcessed(claim));
        }

        let result = self
            .verify_claimed(session, auth, repo, pending)
            .await;

        let settled = match &result {
            Ok(appointment) => {
                self.store
                    .settle(correlation_id, ClaimOutcome::Succeeded, Some(appointment.id), None)
                    .await
            }
            Err(e) => {
                self.store
                    .settle(correlation_id, ClaimOutcome::Failed, None, Some(&e.to_string()))
                    .await
            }
        };
        if let Err(e) = settled {
            tracing::error!("Could not settle payment claim {}: {}", correlation_id, e);
        }

        result.map(VerifyOutcome::Confirmed)
    }

    async fn verify_claimed(
        &self,
        session: &SessionId,
        auth: &SessionAuthManager,
        repo: &dyn AppointmentRepository,
        pending: PendingTransaction,
    ) -> Result<Appointment, EngineError> {
        let correlation_id = pending.correlation_id.as_str();
        let provider = pending.provider;

        let draft: BookingDraft = match serde_json::from_str(&pending.draft_json) {
            Ok(draft) => draft,
            Err(e) => {
                self.discard_pending(session, correlation_id).await;
                return Err(VerificationFailure::CorruptDraft {
                    correlation_id: correlation_id.to_string(),
                    detail: e.to_string(),
                }
                .into());
            }
        };

        let gateway = self.gateway(provider)?;
        let verification = match gateway.verify(correlation_id).await {
            Ok(v) if v.paid => v,
            Ok(v) => {
                self.discard_pending(session, correlation_id).await;
                return Err(VerificationFailure::NotPaid {
                    correlation_id: correlation_id.to_string(),
                    status: v.status,
                }
                .into());
            }
            Err(source) => {
                self.discard_pending(session, correlation_id).await;
                return Err(VerificationFailure::Gateway {
                    correlation_id: correlation_id.to_string(),
                    source,
                }
                .into());
            }
        };

        let split = DepositSplit {
            total: draft.total_price,
            deposit: pending.deposit,
            remaining: pending.remaining,
        };
        let new = draft.confirmed_appointment(provider, &verification.correlation_id, split);
        let new = &new;
        let created = auth
            .authorized(|token| async move { repo.create_appointment(&token, new).await })
            .await;
        self.discard_pending(session, correlation_id).await;

        match created {
            Ok(appointment) => {
                tracing::info!(
                    "Appointment {} confirmed by payment {} ({})",
                    appointment.id,
                    correlation_id,
                    provider
                );
                Ok(appointment)
            }
            Err(e) => {
                // The deposit was taken but no appointment exists.
                tracing::error!(
                    "Paid deposit {} ({}, {} {}) has no appointment: {}",
                    correlation_id,
                    provider,
                    new.date,
                    new.time.format("%H:%M"),
                    e
                );
                Err(e)
            }
        }
    }

    async fn discard_pending(&self, session: &SessionId, correlation_id: &str) {
        if let Err(e) = self.store.clear_pending(session, correlation_id).await {
            tracing::error!(
                "Could not clear pending payment {} of session {}: {}",
                correlation_id,
                session,
                e
            );
        }
    }
}

/// Body of a successful gateway response, or the gateway's own error text.
pub(crate) async fn success_body(resp: reqwest::Response) -> Result<String, GatewayError> {
    let status = resp.status();
    let body = resp.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    Err(GatewayError::Rejected {
        status: status.as_u16(),
        message: gateway_message(&body).unwrap_or(body),
    })
}

/// Paystack reports `{"message": ..}`, Stripe `{"error": {"message": ..}}`.
fn gateway_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error").and_then(|e| e.get("message")))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppointmentStatus, PaymentStatus};
    use crate::testing::{
        authenticated_manager, sample_draft, FakeGateway, FakeRepository, MemoryTransactionStore,
    };
    use std::sync::atomic::Ordering;

    struct Harness {
        session: SessionId,
        store: Arc<MemoryTransactionStore>,
        gateway: Arc<FakeGateway>,
        repo: FakeRepository,
        auth: SessionAuthManager,
        protocol: PaymentProtocol,
    }

    async fn harness() -> Harness {
        let session = SessionId::from_raw("session-1");
        let store = Arc::new(MemoryTransactionStore::default());
        let gateway = Arc::new(FakeGateway::new(PaymentProvider::Paystack));
        let protocol = PaymentProtocol::new(store.clone()).with_gateway(gateway.clone());
        Harness {
            auth: authenticated_manager(&session).await,
            session,
            store,
            gateway,
            repo: FakeRepository::default(),
            protocol,
        }
    }

    async fn started(h: &Harness) -> PaymentRedirect {
        let identity = h.auth.identity().unwrap();
        h.protocol
            .initialize(&h.session, &identity, &sample_draft(), PaymentProvider::Paystack)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_charges_deposit_and_persists() {
        let h = harness().await;
        let redirect = started(&h).await;

        assert_eq!(
            h.gateway.initialized(),
            vec![("ada@example.com".to_string(), "20".parse::<Decimal>().unwrap())]
        );
        let pending = h.store.pending(&h.session).await.unwrap().unwrap();
        assert_eq!(pending.correlation_id, redirect.correlation_id);
        assert_eq!(pending.deposit, "20".parse::<Decimal>().unwrap());
        assert_eq!(pending.remaining, "80".parse::<Decimal>().unwrap());
        assert!(h.repo.created().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_persists_nothing() {
        let h = harness().await;
        h.gateway.fail_initialize.store(true, Ordering::SeqCst);
        let identity = h.auth.identity().unwrap();

        let err = h
            .protocol
            .initialize(&h.session, &identity, &sample_draft(), PaymentProvider::Paystack)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PaymentInit { .. }));
        assert!(h.store.pending(&h.session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verify_success_creates_confirmed_appointment() {
        let h = harness().await;
        let redirect = started(&h).await;

        let outcome = h
            .protocol
            .verify(&h.session, &h.auth, &h.repo, PaymentProvider::Paystack, &redirect.correlation_id)
            .await
            .unwrap();

        assert!(matches!(outcome, VerifyOutcome::Confirmed(_)));
        let created = h.repo.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].status, AppointmentStatus::Confirmed);
        assert_eq!(created[0].payment_status, PaymentStatus::DepositPaid);
        assert_eq!(created[0].payment_reference, redirect.correlation_id);
        assert_eq!(created[0].deposit_amount, "20".parse::<Decimal>().unwrap());
        assert_eq!(created[0].remaining_amount, "80".parse::<Decimal>().unwrap());
        assert!(h.store.pending(&h.session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_verify_is_a_no_op() {
        let h = harness().await;
        let redirect = started(&h).await;

        h.protocol
            .verify(&h.session, &h.auth, &h.repo, PaymentProvider::Paystack, &redirect.correlation_id)
            .await
            .unwrap();
        let again = h
            .protocol
            .verify(&h.session, &h.auth, &h.repo, PaymentProvider::Paystack, &redirect.correlation_id)
            .await
            .unwrap();

        match again {
            VerifyOutcome::AlreadyProcessed(claim) => {
                assert_eq!(claim.outcome, ClaimOutcome::Succeeded);
                assert!(claim.appointment_id.is_some());
            }
            other => panic!("expected no-op, got {other:?}"),
        }
        assert_eq!(h.repo.created().len(), 1);
        assert_eq!(h.gateway.verify_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unpaid_verification_creates_nothing() {
        let h = harness().await;
        let redirect = started(&h).await;
        h.gateway.paid.store(false, Ordering::SeqCst);

        let err = h
            .protocol
            .verify(&h.session, &h.auth, &h.repo, PaymentProvider::Paystack, &redirect.correlation_id)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::PaymentVerification(VerificationFailure::NotPaid { .. })
        ));
        assert!(h.repo.created().is_empty());
        assert!(h.store.pending(&h.session).await.unwrap().is_none());
        assert_eq!(
            h.store.claim(&redirect.correlation_id).unwrap().outcome,
            ClaimOutcome::Failed
        );
    }

    #[tokio::test]
    async fn test_missing_pending_transaction_is_fatal() {
        let h = harness().await;

        let err = h
            .protocol
            .verify(&h.session, &h.auth, &h.repo, PaymentProvider::Paystack, "ref-unknown")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::PaymentVerification(VerificationFailure::NoPendingTransaction)
        ));
        assert_eq!(h.gateway.verify_calls.load(Ordering::SeqCst), 0);
        assert!(h.repo.created().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_callback_leaves_payment_claimable() {
        let h = harness().await;
        let redirect = started(&h).await;
        let stranger = SessionId::from_raw("session-2");

        let err = h
            .protocol
            .verify(&stranger, &h.auth, &h.repo, PaymentProvider::Paystack, &redirect.correlation_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::PaymentVerification(VerificationFailure::NoPendingTransaction)
        ));
        assert!(h.store.claim(&redirect.correlation_id).is_none());

        let outcome = h
            .protocol
            .verify(&h.session, &h.auth, &h.repo, PaymentProvider::Paystack, &redirect.correlation_id)
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::Confirmed(_)));
    }

    #[tokio::test]
    async fn test_creation_conflict_is_reported() {
        let h = harness().await;
        let redirect = started(&h).await;
        h.repo.conflict_on_create.store(true, Ordering::SeqCst);

        let err = h
            .protocol
            .verify(&h.session, &h.auth, &h.repo, PaymentProvider::Paystack, &redirect.correlation_id)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::AvailabilityConflict(_)));
        let claim = h.store.claim(&redirect.correlation_id).unwrap();
        assert_eq!(claim.outcome, ClaimOutcome::Failed);
        assert!(claim.detail.is_some());
    }

    #[tokio::test]
    async fn test_slow_verify_keeps_newer_pending_payment() {
        let h = harness().await;
        let first = started(&h).await;
        h.gateway.paid.store(false, Ordering::SeqCst);

        let gate = h.gateway.verify_gate.lock().await;
        let abandoned = h.protocol.verify(
            &h.session,
            &h.auth,
            &h.repo,
            PaymentProvider::Paystack,
            &first.correlation_id,
        );
        let restarted = async {
            // The first verify has read the gateway and is parked on the gate.
            while h.gateway.verify_calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            let second = started(&h).await;
            h.gateway.paid.store(true, Ordering::SeqCst);
            drop(gate);
            second
        };
        let (abandoned, second) = tokio::join!(abandoned, restarted);

        assert!(matches!(
            abandoned,
            Err(EngineError::PaymentVerification(VerificationFailure::NotPaid { .. }))
        ));
        let pending = h.store.pending(&h.session).await.unwrap().unwrap();
        assert_eq!(pending.correlation_id, second.correlation_id);

        let outcome = h
            .protocol
            .verify(&h.session, &h.auth, &h.repo, PaymentProvider::Paystack, &second.correlation_id)
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::Confirmed(_)));
        assert_eq!(h.repo.created().len(), 1);
    }

    #[tokio::test]
    async fn test_total_too_small_for_a_deposit_is_rejected() {
        let h = harness().await;
        let identity = h.auth.identity().unwrap();
        let draft = BookingDraft {
            total_price: "2".parse().unwrap(),
            ..sample_draft()
        };

        let err = h
            .protocol
            .initialize(&h.session, &identity, &draft, PaymentProvider::Paystack)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DepositTooSmall(_))
        ));
        assert!(h.gateway.initialized().is_empty());
        assert!(h.store.pending(&h.session).await.unwrap().is_none());

        let smallest = BookingDraft {
            total_price: "2.5".parse().unwrap(),
            ..sample_draft()
        };
        h.protocol
            .initialize(&h.session, &identity, &smallest, PaymentProvider::Paystack)
            .await
            .unwrap();
        assert_eq!(h.gateway.initialized()[0].1, Decimal::ONE);
    }

    #[test]
    fn test_gateway_message_shapes() {
        assert_eq!(
            gateway_message(r#"{"status":false,"message":"Invalid key"}"#).as_deref(),
            Some("Invalid key")
        );
        assert_eq!(
            gateway_message(r#"{"error":{"type":"invalid_request_error","message":"No such session"}}"#)
                .as_deref(),
            Some("No such session")
        );
        assert!(gateway_message("<html>").is_none());
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected() {
        let h = harness().await;
        let identity = h.auth.identity().unwrap();
        let err = h
            .protocol
            .initialize(&h.session, &identity, &sample_draft(), PaymentProvider::Stripe)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::ProviderUnavailable(PaymentProvider::Stripe))
        ));
    }
}
