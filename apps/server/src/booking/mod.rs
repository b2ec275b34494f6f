//! Booking orchestration.
//!
//! [`BookingEngine`] drives a session's [`BookingFlow`] against the
//! repository, the session's slot feed and the payment protocol. The flow
//! itself never performs I/O; the engine does, and feeds the results back
//! through the flow's epoch-checked transitions.

pub mod dashboard;
pub mod draft;
pub mod flow;

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{EngineError, ValidationError};
use crate::models::{
    Appointment, AppointmentPatch, AppointmentScope, AppointmentStatus, DaySlots,
    PaymentProvider, ServiceCategory, SubmitRequest,
};
use crate::payment::{Claim, PaymentProtocol, PaymentRedirect, VerificationFailure, VerifyOutcome};
use crate::repository::AppointmentRepository;
use crate::session::{Identity, SessionContext};
use crate::slots::{slots_for_day, BusinessClock};

pub use dashboard::{AppointmentBoard, StatusSummary};
pub use draft::{BookingDraft, ServiceSet};
pub use flow::{
    BookingFlow, ContactDetails, Destination, FlowState, Schedule, Selection, Submission,
    SubmissionOutcome,
};

/// The flow state together with the slot list it is looking at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowView {
    pub state: FlowState,
    pub slots: Option<DaySlots>,
}

/// How a payment return trip ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentReturn {
    Confirmed {
        appointment: Appointment,
        destination: Destination,
    },
    /// A repeated callback; nothing was done this time.
    AlreadyProcessed {
        claim: Claim,
        destination: Destination,
    },
}

pub struct BookingEngine {
    repo: Arc<dyn AppointmentRepository>,
    payments: PaymentProtocol,
    clock: BusinessClock,
}

impl BookingEngine {
    pub fn new(
        repo: Arc<dyn AppointmentRepository>,
        payments: PaymentProtocol,
        clock: BusinessClock,
    ) -> Self {
        Self {
            repo,
            payments,
            clock,
        }
    }

    pub fn payments(&self) -> &PaymentProtocol {
        &self.payments
    }

    pub fn clock(&self) -> BusinessClock {
        self.clock
    }

    pub fn view(&self, ctx: &SessionContext) -> FlowView {
        FlowView {
            state: ctx.with_flow(|flow| flow.state().clone()),
            slots: ctx.slots.current(),
        }
    }

    fn step<F>(&self, ctx: &SessionContext, transition: F) -> Result<FlowView, EngineError>
    where
        F: FnOnce(&mut BookingFlow) -> Result<(), ValidationError>,
    {
        ctx.with_flow(transition)?;
        Ok(self.view(ctx))
    }

    pub async fn categories(&self) -> Result<Vec<ServiceCategory>, EngineError> {
        Ok(self.repo.list_categories().await?)
    }

    // ── Flow transitions ──

    pub fn reset(&self, ctx: &SessionContext) -> FlowView {
        ctx.with_flow(BookingFlow::reset);
        ctx.slots.clear();
        self.view(ctx)
    }

    pub async fn choose_category(
        &self,
        ctx: &SessionContext,
        category_id: i64,
    ) -> Result<FlowView, EngineError> {
        let category = self
            .categories()
            .await?
            .into_iter()
            .find(|c| c.id == category_id)
            .ok_or(ValidationError::UnknownCategory(category_id))?;
        self.step(ctx, |flow| flow.choose_category(category))
    }

    pub fn toggle_service(
        &self,
        ctx: &SessionContext,
        service_id: i64,
    ) -> Result<FlowView, EngineError> {
        self.step(ctx, |flow| flow.toggle_service(service_id).map(drop))
    }

    pub fn continue_to_schedule(&self, ctx: &SessionContext) -> Result<FlowView, EngineError> {
        self.step(ctx, BookingFlow::continue_to_schedule)
    }

    /// Fetch booked times for `date` into the session's slot feed. `None`
    /// when a newer load superseded this one.
    pub async fn load_slots(
        &self,
        ctx: &SessionContext,
        date: NaiveDate,
    ) -> Result<Option<DaySlots>, EngineError> {
        let repo = &*self.repo;
        let auth = &ctx.auth;
        ctx.slots
            .load(date, self.clock.now(), |date| async move {
                auth.authorized(|token| async move { repo.list_booked_times(&token, date).await })
                    .await
            })
            .await
    }

    pub async fn choose_date(
        &self,
        ctx: &SessionContext,
        date: NaiveDate,
    ) -> Result<FlowView, EngineError> {
        ctx.with_flow(|flow| flow.choose_date(date))?;
        self.load_slots(ctx, date).await?;
        Ok(self.view(ctx))
    }

    pub fn choose_time(&self, ctx: &SessionContext, time: NaiveTime) -> Result<FlowView, EngineError> {
        let day = ctx.slots.current();
        self.step(ctx, |flow| flow.choose_time(time, day.as_ref()))
    }

    pub fn continue_to_details(&self, ctx: &SessionContext) -> Result<FlowView, EngineError> {
        self.step(ctx, BookingFlow::continue_to_details)
    }

    pub fn back(&self, ctx: &SessionContext) -> Result<FlowView, EngineError> {
        self.step(ctx, BookingFlow::back)
    }

    /// Enter the reschedule flow for one of the caller's appointments.
    pub async fn begin_reschedule(
        &self,
        ctx: &SessionContext,
        appointment_id: i64,
    ) -> Result<FlowView, EngineError> {
        let appointment = self
            .visible_appointments(ctx)
            .await?
            .into_iter()
            .find(|a| a.id == appointment_id)
            .ok_or(ValidationError::AppointmentNotFound(appointment_id))?;

        ctx.slots.clear();
        self.step(ctx, |flow| flow.begin_reschedule(appointment))
    }

    // ── Submission ──

    /// Submit the collected details. A new booking ends awaiting payment,
    /// a reschedule ends confirmed.
    pub async fn submit(
        &self,
        ctx: &SessionContext,
        request: SubmitRequest,
    ) -> Result<FlowView, EngineError> {
        let identity = ctx.auth.require_identity()?;
        let details = ContactDetails {
            phone: request.phone,
            notes: request.notes,
        };
        let Submission { epoch, draft } =
            ctx.with_flow(|flow| flow.begin_submission(details, &identity))?;

        let result = match draft.reschedule_id {
            Some(appointment_id) => self
                .apply_reschedule(ctx, appointment_id, &draft, &identity)
                .await
                .map(|appointment| SubmissionOutcome::Confirmed {
                    appointment,
                    destination: Destination::for_admin(identity.is_admin),
                }),
            None => self
                .start_payment(ctx, &identity, &draft, request.provider)
                .await
                .map(SubmissionOutcome::AwaitingPayment),
        };

        let outcome = match &result {
            Ok(outcome) => outcome.clone(),
            Err(EngineError::AvailabilityConflict(_)) => SubmissionOutcome::Conflict,
            Err(_) => SubmissionOutcome::Failed,
        };
        if !ctx.with_flow(|flow| flow.finish_submission(epoch, outcome)) {
            tracing::info!("Session {} moved on; submission result dropped", ctx.id);
        }

        match result {
            Ok(_) => Ok(self.view(ctx)),
            Err(err @ EngineError::AvailabilityConflict(_)) => {
                if let Err(reload) = self.load_slots(ctx, draft.date).await {
                    tracing::warn!("Could not reload slots for {}: {}", draft.date, reload);
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_reschedule(
        &self,
        ctx: &SessionContext,
        appointment_id: i64,
        draft: &BookingDraft,
        identity: &Identity,
    ) -> Result<Appointment, EngineError> {
        let patch = AppointmentPatch {
            date: Some(draft.date),
            time: Some(draft.time),
            service_ids: Some(draft.service_ids()),
            is_rescheduled: Some(true),
            ..AppointmentPatch::default()
        };
        let repo = &*self.repo;
        let patch = &patch;
        let appointment = ctx
            .auth
            .authorized(|token| async move {
                repo.update_appointment(&token, appointment_id, patch).await
            })
            .await?;

        tracing::info!(
            "Appointment {} rescheduled to {} {} by {}",
            appointment.id,
            draft.date,
            draft.time.format("%H:%M"),
            identity.email
        );
        Ok(appointment)
    }

    async fn start_payment(
        &self,
        ctx: &SessionContext,
        identity: &Identity,
        draft: &BookingDraft,
        provider: Option<PaymentProvider>,
    ) -> Result<PaymentRedirect, EngineError> {
        let provider = provider
            .or_else(|| self.payments.default_provider())
            .ok_or(ValidationError::NoPaymentProvider)?;

        // Another client may have taken the slot since it was chosen.
        let repo = &*self.repo;
        let date = draft.date;
        let booked = ctx
            .auth
            .authorized(|token| async move { repo.list_booked_times(&token, date).await })
            .await?;
        let day = slots_for_day(date, &booked, self.clock.now());
        let slot = day
            .slot(draft.time)
            .ok_or(ValidationError::UnknownSlot(draft.time))?;
        if let Some(reason) = slot.reason {
            return Err(EngineError::AvailabilityConflict(format!(
                "{} {} is {}",
                date,
                draft.time.format("%H:%M"),
                reason.to_string().to_lowercase()
            )));
        }

        self.payments
            .initialize(&ctx.id, identity, draft, provider)
            .await
    }

    /// Handle the return from the payment gateway.
    pub async fn complete_payment(
        &self,
        ctx: &SessionContext,
        provider: PaymentProvider,
        correlation_id: &str,
    ) -> Result<PaymentReturn, EngineError> {
        let destination = Destination::for_admin(ctx.auth.is_admin());
        let outcome = self
            .payments
            .verify(&ctx.id, &ctx.auth, &*self.repo, provider, correlation_id)
            .await;

        match outcome {
            Ok(VerifyOutcome::Confirmed(appointment)) => {
                ctx.with_flow(|flow| flow.payment_confirmed(appointment.clone(), destination));
                ctx.slots.clear();
                Ok(PaymentReturn::Confirmed {
                    appointment,
                    destination,
                })
            }
            Ok(VerifyOutcome::AlreadyProcessed(claim)) => Ok(PaymentReturn::AlreadyProcessed {
                claim,
                destination,
            }),
            Err(EngineError::AvailabilityConflict(detail)) => {
                if let Some(date) = ctx.with_flow(BookingFlow::payment_conflict) {
                    ctx.slots.clear();
                    if let Err(e) = self.load_slots(ctx, date).await {
                        tracing::warn!(
                            "Could not reload slots for {} after a paid conflict: {}",
                            date,
                            e
                        );
                    }
                }
                Err(EngineError::AvailabilityConflict(detail))
            }
            Err(err) => {
                // A pending transaction of this session that was never
                // matched is left alone.
                let unrelated = matches!(
                    err,
                    EngineError::PaymentVerification(
                        VerificationFailure::NoPendingTransaction
                            | VerificationFailure::Mismatch { .. }
                    )
                );
                if !unrelated && ctx.with_flow(BookingFlow::abandon_payment) {
                    ctx.slots.clear();
                }
                Err(err)
            }
        }
    }

    // ── Dashboard ──

    fn scope(ctx: &SessionContext) -> AppointmentScope {
        if ctx.auth.is_admin() {
            AppointmentScope::All
        } else {
            AppointmentScope::Own
        }
    }

    async fn visible_appointments(
        &self,
        ctx: &SessionContext,
    ) -> Result<Vec<Appointment>, EngineError> {
        ctx.auth.require_identity()?;
        let repo = &*self.repo;
        let scope = Self::scope(ctx);
        ctx.auth
            .authorized(|token| async move { repo.list_appointments(&token, scope).await })
            .await
    }

    pub async fn appointments(
        &self,
        ctx: &SessionContext,
        status: Option<AppointmentStatus>,
    ) -> Result<AppointmentBoard, EngineError> {
        let appointments = self.visible_appointments(ctx).await?;
        Ok(dashboard::partition(appointments, status, self.clock.now()))
    }

    pub async fn summary(&self, ctx: &SessionContext) -> Result<StatusSummary, EngineError> {
        Ok(dashboard::summarize(&self.visible_appointments(ctx).await?))
    }

    pub async fn cancel(
        &self,
        ctx: &SessionContext,
        appointment_id: i64,
    ) -> Result<Appointment, EngineError> {
        let identity = ctx.auth.require_identity()?;
        let cancelled = self
            .patch(ctx, appointment_id, AppointmentPatch {
                status: Some(AppointmentStatus::Cancelled),
                ..AppointmentPatch::default()
            })
            .await?;
        tracing::info!("Appointment {} cancelled by {}", appointment_id, identity.email);
        Ok(cancelled)
    }

    pub async fn set_status(
        &self,
        ctx: &SessionContext,
        appointment_id: i64,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        Self::require_admin(ctx)?;
        let updated = self
            .patch(ctx, appointment_id, AppointmentPatch {
                status: Some(status),
                ..AppointmentPatch::default()
            })
            .await?;
        tracing::info!("Appointment {} set to {}", appointment_id, status.as_str());
        Ok(updated)
    }

    pub async fn delete(&self, ctx: &SessionContext, appointment_id: i64) -> Result<(), EngineError> {
        Self::require_admin(ctx)?;
        let repo = &*self.repo;
        ctx.auth
            .authorized(|token| async move { repo.delete_appointment(&token, appointment_id).await })
            .await?;
        tracing::info!("Appointment {} deleted", appointment_id);
        Ok(())
    }

    fn require_admin(ctx: &SessionContext) -> Result<(), EngineError> {
        if ctx.auth.require_identity()?.is_admin {
            Ok(())
        } else {
            Err(EngineError::Forbidden)
        }
    }

    async fn patch(
        &self,
        ctx: &SessionContext,
        appointment_id: i64,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        let repo = &*self.repo;
        let patch = &patch;
        ctx.auth
            .authorized(|token| async move {
                repo.update_appointment(&token, appointment_id, patch).await
            })
            .await
    }
}
