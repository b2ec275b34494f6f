//! The booking state machine.
//!
//! Each step owns exactly the data that is valid in it; transitions are
//! methods that either move to the next step or reject with a
//! [`ValidationError`] and leave the state untouched.

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;

use super::draft::{BookingDraft, ServiceSet};
use crate::error::ValidationError;
use crate::models::{
    hhmm_opt, Appointment, AppointmentStatus, DaySlots, ServiceCategory, ServiceRef, SlotReason,
};
use crate::payment::PaymentRedirect;
use crate::session::Identity;

/// Where the user lands after a booking is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    ClientDashboard,
    AdminDashboard,
}

impl Destination {
    pub fn for_admin(is_admin: bool) -> Self {
        if is_admin {
            Self::AdminDashboard
        } else {
            Self::ClientDashboard
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Self::ClientDashboard => "/client-dashboard",
            Self::AdminDashboard => "/admin",
        }
    }
}

/// What the slot is being chosen for.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    NewBooking {
        category: ServiceCategory,
        services: ServiceSet,
    },
    /// Services are locked to the appointment's own.
    Reschedule { appointment: Appointment },
}

impl Selection {
    fn is_reschedule(&self) -> bool {
        matches!(self, Self::Reschedule { .. })
    }

    fn has_services(&self) -> bool {
        match self {
            Self::NewBooking { services, .. } => !services.is_empty(),
            Self::Reschedule { appointment } => !appointment.services.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    pub selection: Selection,
    pub date: Option<NaiveDate>,
    #[serde(with = "hhmm_opt")]
    pub time: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum FlowState {
    CategorySelection {
        services: ServiceSet,
    },
    ServiceSelection {
        category: ServiceCategory,
        services: ServiceSet,
    },
    DateTimeSelection {
        schedule: Schedule,
    },
    DetailsCollection {
        schedule: Schedule,
    },
    Submitting {
        schedule: Schedule,
        draft: BookingDraft,
    },
    AwaitingPayment {
        schedule: Schedule,
        draft: BookingDraft,
        redirect: PaymentRedirect,
    },
    Confirmed {
        appointment: Appointment,
        destination: Destination,
    },
}

impl FlowState {
    pub fn step(&self) -> &'static str {
        match self {
            Self::CategorySelection { .. } => "category selection",
            Self::ServiceSelection { .. } => "service selection",
            Self::DateTimeSelection { .. } => "date and time selection",
            Self::DetailsCollection { .. } => "details collection",
            Self::Submitting { .. } => "submission",
            Self::AwaitingPayment { .. } => "payment",
            Self::Confirmed { .. } => "confirmation",
        }
    }
}

impl Default for FlowState {
    fn default() -> Self {
        Self::CategorySelection {
            services: ServiceSet::default(),
        }
    }
}

/// Contact details collected on the last step.
#[derive(Debug, Clone, Default)]
pub struct ContactDetails {
    pub phone: Option<String>,
    pub notes: Option<String>,
}

/// Handle on an in-flight submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub epoch: u64,
    pub draft: BookingDraft,
}

#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    AwaitingPayment(PaymentRedirect),
    Confirmed {
        appointment: Appointment,
        destination: Destination,
    },
    /// The slot was taken; the user picks another time.
    Conflict,
    /// Anything else; the draft is kept for a retry.
    Failed,
}

#[derive(Debug, Default)]
pub struct BookingFlow {
    state: FlowState,
    epoch: u64,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl BookingFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn reject(&self, action: &'static str) -> ValidationError {
        ValidationError::InvalidTransition {
            action,
            step: self.state.step(),
        }
    }

    /// Abandon whatever is in progress. Responses for the old flow are
    /// dropped from here on.
    pub fn reset(&mut self) {
        self.state = FlowState::default();
        self.epoch += 1;
    }

    pub fn choose_category(&mut self, category: ServiceCategory) -> Result<(), ValidationError> {
        let services = match &mut self.state {
            FlowState::CategorySelection { services }
            | FlowState::ServiceSelection { services, .. } => std::mem::take(services),
            _ => return Err(self.reject("choose a category")),
        };
        self.state = FlowState::ServiceSelection { category, services };
        Ok(())
    }

    /// Toggle a service of the current category. Returns whether it is
    /// selected afterwards.
    pub fn toggle_service(&mut self, service_id: i64) -> Result<bool, ValidationError> {
        match &mut self.state {
            FlowState::ServiceSelection { category, services } => {
                let service = category
                    .service(service_id)
                    .ok_or(ValidationError::UnknownService(service_id))?;
                Ok(services.toggle(service))
            }
            FlowState::DateTimeSelection { schedule } | FlowState::DetailsCollection { schedule }
                if schedule.selection.is_reschedule() =>
            {
                Err(ValidationError::ServicesLocked)
            }
            _ => Err(self.reject("change services")),
        }
    }

    pub fn continue_to_schedule(&mut self) -> Result<(), ValidationError> {
        let FlowState::ServiceSelection { services, .. } = &self.state else {
            return Err(self.reject("continue to scheduling"));
        };
        if services.is_empty() {
            return Err(ValidationError::NoServices);
        }

        if let FlowState::ServiceSelection { category, services } = std::mem::take(&mut self.state)
        {
            self.state = FlowState::DateTimeSelection {
                schedule: Schedule {
                    selection: Selection::NewBooking { category, services },
                    date: None,
                    time: None,
                },
            };
        }
        Ok(())
    }

    /// Start a reschedule of `appointment`, skipping category and service
    /// selection.
    pub fn begin_reschedule(&mut self, appointment: Appointment) -> Result<(), ValidationError> {
        if appointment.status == AppointmentStatus::Cancelled {
            return Err(ValidationError::NotReschedulable(appointment.id));
        }
        self.epoch += 1;
        self.state = FlowState::DateTimeSelection {
            schedule: Schedule {
                selection: Selection::Reschedule { appointment },
                date: None,
                time: None,
            },
        };
        Ok(())
    }

    /// Pick a date. Any previously chosen time is cleared.
    pub fn choose_date(&mut self, date: NaiveDate) -> Result<(), ValidationError> {
        match &mut self.state {
            FlowState::DateTimeSelection { schedule } => {
                if schedule.date != Some(date) {
                    schedule.time = None;
                }
                schedule.date = Some(date);
                Ok(())
            }
            _ => Err(self.reject("choose a date")),
        }
    }

    /// Pick a time from the visible slot list, which must be for the chosen
    /// date.
    pub fn choose_time(
        &mut self,
        time: NaiveTime,
        day: Option<&DaySlots>,
    ) -> Result<(), ValidationError> {
        let FlowState::DateTimeSelection { schedule } = &mut self.state else {
            return Err(self.reject("choose a time"));
        };
        let date = schedule.date.ok_or(ValidationError::DateMissing)?;
        let day = day
            .filter(|d| d.date == date)
            .ok_or(ValidationError::SlotsNotLoaded(date))?;
        let slot = day.slot(time).ok_or(ValidationError::UnknownSlot(time))?;
        if !slot.available {
            return Err(ValidationError::SlotUnavailable {
                time,
                reason: slot.reason.unwrap_or(SlotReason::AlreadyBooked),
            });
        }

        schedule.time = Some(time);
        Ok(())
    }

    pub fn continue_to_details(&mut self) -> Result<(), ValidationError> {
        let FlowState::DateTimeSelection { schedule } = &self.state else {
            return Err(self.reject("continue to details"));
        };
        if schedule.date.is_none() {
            return Err(ValidationError::DateMissing);
        }
        if schedule.time.is_none() {
            return Err(ValidationError::TimeMissing);
        }
        if !schedule.selection.has_services() && !schedule.selection.is_reschedule() {
            return Err(ValidationError::NoServices);
        }

        if let FlowState::DateTimeSelection { schedule } = std::mem::take(&mut self.state) {
            self.state = FlowState::DetailsCollection { schedule };
        }
        Ok(())
    }

    /// One step backwards. Never back into service selection while the
    /// services are locked by a reschedule.
    pub fn back(&mut self) -> Result<(), ValidationError> {
        let previous = match std::mem::take(&mut self.state) {
            FlowState::ServiceSelection { services, .. } => {
                FlowState::CategorySelection { services }
            }
            FlowState::DateTimeSelection { schedule } => match schedule.selection {
                Selection::NewBooking { category, services } => {
                    FlowState::ServiceSelection { category, services }
                }
                selection @ Selection::Reschedule { .. } => {
                    self.state = FlowState::DateTimeSelection {
                        schedule: Schedule {
                            selection,
                            ..schedule
                        },
                    };
                    return Err(ValidationError::ServicesLocked);
                }
            },
            FlowState::DetailsCollection { schedule } => FlowState::DateTimeSelection { schedule },
            other => {
                self.state = other;
                return Err(self.reject("go back"));
            }
        };
        self.state = previous;
        Ok(())
    }

    /// Validate the collected details and freeze them into a draft.
    ///
    /// A phone number is required for new bookings; the one on the identity
    /// record is used when none is supplied.
    pub fn begin_submission(
        &mut self,
        details: ContactDetails,
        identity: &Identity,
    ) -> Result<Submission, ValidationError> {
        let FlowState::DetailsCollection { schedule } = &self.state else {
            return Err(self.reject("submit"));
        };
        let date = schedule.date.ok_or(ValidationError::DateMissing)?;
        let time = schedule.time.ok_or(ValidationError::TimeMissing)?;
        let phone = non_empty(details.phone).or_else(|| non_empty(identity.phone.clone()));

        let (services, total_price, total_duration, reschedule_id) = match &schedule.selection {
            Selection::NewBooking { services, .. } => {
                if services.is_empty() {
                    return Err(ValidationError::NoServices);
                }
                if phone.is_none() {
                    return Err(ValidationError::PhoneRequired);
                }
                (
                    services.services().iter().map(ServiceRef::from).collect(),
                    services.total_price(),
                    services.total_duration()?,
                    None,
                )
            }
            Selection::Reschedule { appointment } => (
                appointment.services.clone(),
                appointment.total_price,
                appointment.total_duration,
                Some(appointment.id),
            ),
        };

        let draft = BookingDraft {
            services,
            date,
            time,
            client_name: identity.full_name.clone(),
            client_email: identity.email.clone(),
            client_phone: phone,
            notes: non_empty(details.notes),
            reschedule_id,
            total_price,
            total_duration,
        };

        if let FlowState::DetailsCollection { schedule } = std::mem::take(&mut self.state) {
            self.state = FlowState::Submitting {
                schedule,
                draft: draft.clone(),
            };
        }
        self.epoch += 1;
        Ok(Submission {
            epoch: self.epoch,
            draft,
        })
    }

    /// Apply the result of the submission started at `epoch`. Returns
    /// `false` when the flow moved on in the meantime and the result was
    /// dropped.
    pub fn finish_submission(&mut self, epoch: u64, outcome: SubmissionOutcome) -> bool {
        if epoch != self.epoch || !matches!(self.state, FlowState::Submitting { .. }) {
            return false;
        }
        let FlowState::Submitting { schedule, draft } = std::mem::take(&mut self.state) else {
            return false;
        };

        self.state = match outcome {
            SubmissionOutcome::AwaitingPayment(redirect) => {
                FlowState::AwaitingPayment {
                    schedule,
                    draft,
                    redirect,
                }
            }
            SubmissionOutcome::Confirmed {
                appointment,
                destination,
            } => FlowState::Confirmed {
                appointment,
                destination,
            },
            SubmissionOutcome::Conflict => FlowState::DateTimeSelection {
                schedule: Schedule {
                    time: None,
                    ..schedule
                },
            },
            SubmissionOutcome::Failed => FlowState::DetailsCollection { schedule },
        };
        true
    }

    /// The deposit for this session was verified and the appointment exists.
    pub fn payment_confirmed(&mut self, appointment: Appointment, destination: Destination) {
        self.epoch += 1;
        self.state = FlowState::Confirmed {
            appointment,
            destination,
        };
    }

    /// The payment came back unusable. A flow still waiting on it starts
    /// over; returns whether that happened.
    pub fn abandon_payment(&mut self) -> bool {
        if !matches!(self.state, FlowState::AwaitingPayment { .. }) {
            return false;
        }
        self.reset();
        true
    }

    /// The deposit was paid but the slot was taken before the appointment
    /// could be created. The same selection goes back to time selection on
    /// the draft's date, which is returned so its slots can be reloaded.
    pub fn payment_conflict(&mut self) -> Option<NaiveDate> {
        if !matches!(self.state, FlowState::AwaitingPayment { .. }) {
            return None;
        }
        let FlowState::AwaitingPayment {
            schedule, draft, ..
        } = std::mem::take(&mut self.state)
        else {
            return None;
        };
        self.epoch += 1;
        self.state = FlowState::DateTimeSelection {
            schedule: Schedule {
                date: Some(draft.date),
                time: None,
                ..schedule
            },
        };
        Some(draft.date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentProvider;
    use crate::slots::slots_for_day;
    use crate::testing::{coloring_category, confirmed_appointment, identity};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 5, 1).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day(booked: &[NaiveTime]) -> DaySlots {
        let now = NaiveDate::from_ymd_opt(2030, 4, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        slots_for_day(date(), booked, now)
    }

    fn at_details(flow: &mut BookingFlow) {
        flow.choose_category(coloring_category()).unwrap();
        flow.toggle_service(1).unwrap();
        flow.toggle_service(2).unwrap();
        flow.continue_to_schedule().unwrap();
        flow.choose_date(date()).unwrap();
        flow.choose_time(time(10, 0), Some(&day(&[]))).unwrap();
        flow.continue_to_details().unwrap();
    }

    fn details(phone: &str) -> ContactDetails {
        ContactDetails {
            phone: Some(phone.into()),
            notes: None,
        }
    }

    #[test]
    fn test_service_selection_requires_a_service() {
        let mut flow = BookingFlow::new();
        flow.choose_category(coloring_category()).unwrap();
        assert_eq!(flow.continue_to_schedule(), Err(ValidationError::NoServices));

        assert!(flow.toggle_service(1).unwrap());
        assert!(!flow.toggle_service(1).unwrap());
        assert_eq!(flow.continue_to_schedule(), Err(ValidationError::NoServices));
        assert_eq!(flow.toggle_service(99), Err(ValidationError::UnknownService(99)));
    }

    #[test]
    fn test_new_booking_totals() {
        let mut flow = BookingFlow::new();
        at_details(&mut flow);
        let submission = flow.begin_submission(details("0800"), &identity(false)).unwrap();

        assert_eq!(submission.draft.total_price, "100".parse().unwrap());
        assert_eq!(submission.draft.total_duration, 90);
        assert_eq!(submission.draft.service_ids(), vec![1, 2]);
        assert_eq!(submission.draft.time, time(10, 0));
        assert!(matches!(flow.state(), FlowState::Submitting { .. }));
    }

    #[test]
    fn test_booked_slot_cannot_be_chosen() {
        let mut flow = BookingFlow::new();
        flow.choose_category(coloring_category()).unwrap();
        flow.toggle_service(1).unwrap();
        flow.continue_to_schedule().unwrap();
        flow.choose_date(date()).unwrap();

        let booked = day(&[time(10, 0)]);
        let slot = booked.slot(time(10, 0)).unwrap();
        assert!(!slot.available);
        assert_eq!(slot.reason, Some(SlotReason::AlreadyBooked));

        assert_eq!(
            flow.choose_time(time(10, 0), Some(&booked)),
            Err(ValidationError::SlotUnavailable {
                time: time(10, 0),
                reason: SlotReason::AlreadyBooked,
            })
        );
        assert_eq!(flow.continue_to_details(), Err(ValidationError::TimeMissing));
    }

    #[test]
    fn test_time_needs_slots_for_the_chosen_date() {
        let mut flow = BookingFlow::new();
        flow.choose_category(coloring_category()).unwrap();
        flow.toggle_service(1).unwrap();
        flow.continue_to_schedule().unwrap();

        assert_eq!(
            flow.choose_time(time(10, 0), Some(&day(&[]))),
            Err(ValidationError::DateMissing)
        );
        let other = date().succ_opt().unwrap();
        flow.choose_date(other).unwrap();
        assert_eq!(
            flow.choose_time(time(10, 0), Some(&day(&[]))),
            Err(ValidationError::SlotsNotLoaded(other))
        );
    }

    #[test]
    fn test_changing_date_clears_time() {
        let mut flow = BookingFlow::new();
        flow.choose_category(coloring_category()).unwrap();
        flow.toggle_service(1).unwrap();
        flow.continue_to_schedule().unwrap();
        flow.choose_date(date()).unwrap();
        flow.choose_time(time(10, 0), Some(&day(&[]))).unwrap();

        flow.choose_date(date().succ_opt().unwrap()).unwrap();
        match flow.state() {
            FlowState::DateTimeSelection { schedule } => assert!(schedule.time.is_none()),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_phone_required_for_new_booking() {
        let mut flow = BookingFlow::new();
        at_details(&mut flow);
        assert_eq!(
            flow.begin_submission(details("  "), &identity(false)).unwrap_err(),
            ValidationError::PhoneRequired
        );

        let mut with_phone = identity(false);
        with_phone.phone = Some("0800".into());
        let submission = flow
            .begin_submission(ContactDetails::default(), &with_phone)
            .unwrap();
        assert_eq!(submission.draft.client_phone.as_deref(), Some("0800"));
    }

    #[test]
    fn test_reschedule_starts_at_schedule_with_locked_services() {
        let mut flow = BookingFlow::new();
        flow.begin_reschedule(confirmed_appointment(42)).unwrap();

        assert!(matches!(flow.state(), FlowState::DateTimeSelection { .. }));
        assert_eq!(flow.toggle_service(1), Err(ValidationError::ServicesLocked));
        assert_eq!(flow.back(), Err(ValidationError::ServicesLocked));
        assert!(matches!(flow.state(), FlowState::DateTimeSelection { .. }));

        flow.choose_date(date()).unwrap();
        flow.choose_time(time(14, 0), Some(&day(&[]))).unwrap();
        flow.continue_to_details().unwrap();

        let submission = flow
            .begin_submission(ContactDetails::default(), &identity(false))
            .unwrap();
        assert_eq!(submission.draft.reschedule_id, Some(42));
        assert_eq!(submission.draft.service_ids(), vec![1, 2]);
        assert_eq!(submission.draft.time, time(14, 0));
    }

    #[test]
    fn test_cancelled_appointment_cannot_be_rescheduled() {
        let mut appointment = confirmed_appointment(7);
        appointment.status = AppointmentStatus::Cancelled;
        let mut flow = BookingFlow::new();
        assert_eq!(
            flow.begin_reschedule(appointment),
            Err(ValidationError::NotReschedulable(7))
        );
    }

    #[test]
    fn test_conflict_returns_to_slot_selection() {
        let mut flow = BookingFlow::new();
        at_details(&mut flow);
        let submission = flow.begin_submission(details("0800"), &identity(false)).unwrap();

        assert!(flow.finish_submission(submission.epoch, SubmissionOutcome::Conflict));
        match flow.state() {
            FlowState::DateTimeSelection { schedule } => {
                assert_eq!(schedule.date, Some(date()));
                assert!(schedule.time.is_none());
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_failure_keeps_details() {
        let mut flow = BookingFlow::new();
        at_details(&mut flow);
        let submission = flow.begin_submission(details("0800"), &identity(false)).unwrap();

        assert!(flow.finish_submission(submission.epoch, SubmissionOutcome::Failed));
        assert!(matches!(flow.state(), FlowState::DetailsCollection { .. }));
    }

    #[test]
    fn test_stale_submission_result_is_dropped() {
        let mut flow = BookingFlow::new();
        at_details(&mut flow);
        let submission = flow.begin_submission(details("0800"), &identity(false)).unwrap();
        flow.reset();

        let redirect = PaymentRedirect {
            provider: PaymentProvider::Paystack,
            redirect_url: "https://pay.example.com/x".into(),
            correlation_id: "ref-1".into(),
        };
        assert!(!flow.finish_submission(
            submission.epoch,
            SubmissionOutcome::AwaitingPayment(redirect)
        ));
        assert_eq!(flow.state(), &FlowState::default());
    }

    #[test]
    fn test_abandoned_payment_restarts_flow() {
        let mut flow = BookingFlow::new();
        at_details(&mut flow);
        let submission = flow.begin_submission(details("0800"), &identity(false)).unwrap();
        let redirect = PaymentRedirect {
            provider: PaymentProvider::Stripe,
            redirect_url: "https://pay.example.com/y".into(),
            correlation_id: "cs_1".into(),
        };
        flow.finish_submission(submission.epoch, SubmissionOutcome::AwaitingPayment(redirect));

        assert!(flow.abandon_payment());
        assert_eq!(flow.state(), &FlowState::default());
        assert!(flow.epoch() > submission.epoch);
        assert!(!flow.abandon_payment());
    }

    #[test]
    fn test_paid_conflict_keeps_selection_and_date() {
        let mut flow = BookingFlow::new();
        assert_eq!(flow.payment_conflict(), None);

        at_details(&mut flow);
        let submission = flow.begin_submission(details("0800"), &identity(false)).unwrap();
        let redirect = PaymentRedirect {
            provider: PaymentProvider::Paystack,
            redirect_url: "https://pay.example.com/z".into(),
            correlation_id: "ref-9".into(),
        };
        flow.finish_submission(submission.epoch, SubmissionOutcome::AwaitingPayment(redirect));

        assert_eq!(flow.payment_conflict(), Some(date()));
        match flow.state() {
            FlowState::DateTimeSelection { schedule } => {
                assert!(matches!(
                    &schedule.selection,
                    Selection::NewBooking { services, .. } if !services.is_empty()
                ));
                assert_eq!(schedule.date, Some(date()));
                assert!(schedule.time.is_none());
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(flow.epoch() > submission.epoch);
        assert_eq!(flow.payment_conflict(), None);
    }

    #[test]
    fn test_double_submission_is_rejected() {
        let mut flow = BookingFlow::new();
        at_details(&mut flow);
        flow.begin_submission(details("0800"), &identity(false)).unwrap();
        assert!(matches!(
            flow.begin_submission(details("0800"), &identity(false)),
            Err(ValidationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_back_walks_one_step() {
        let mut flow = BookingFlow::new();
        at_details(&mut flow);

        flow.back().unwrap();
        assert!(matches!(flow.state(), FlowState::DateTimeSelection { .. }));
        flow.back().unwrap();
        match flow.state() {
            FlowState::ServiceSelection { services, .. } => assert_eq!(services.len(), 2),
            other => panic!("unexpected state {other:?}"),
        }
        flow.back().unwrap();
        assert!(matches!(flow.state(), FlowState::CategorySelection { .. }));
        assert!(flow.back().is_err());
    }
}
