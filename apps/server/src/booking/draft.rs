use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{
    hhmm, AppointmentStatus, NewAppointment, PaymentProvider, PaymentStatus, Service, ServiceRef,
};
use crate::pricing::{self, DepositSplit, DurationError};

/// Selected services, ordered by selection, unique by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceSet(Vec<Service>);

impl ServiceSet {
    /// Add `service`, or remove it if already selected. Returns whether it
    /// is selected afterwards.
    pub fn toggle(&mut self, service: &Service) -> bool {
        if let Some(pos) = self.0.iter().position(|s| s.id == service.id) {
            self.0.remove(pos);
            false
        } else {
            self.0.push(service.clone());
            true
        }
    }

    pub fn contains(&self, service_id: i64) -> bool {
        self.0.iter().any(|s| s.id == service_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn services(&self) -> &[Service] {
        &self.0
    }

    pub fn total_price(&self) -> Decimal {
        pricing::total_price(&self.0)
    }

    pub fn total_duration(&self) -> Result<u32, DurationError> {
        pricing::total_duration(&self.0)
    }
}

/// A fully specified booking, ready to be paid for or applied as a
/// reschedule. Stored verbatim inside the pending transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingDraft {
    pub services: Vec<ServiceRef>,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub client_name: String,
    pub client_email: String,
    pub client_phone: Option<String>,
    pub notes: Option<String>,
    pub reschedule_id: Option<i64>,
    pub total_price: Decimal,
    pub total_duration: u32,
}

impl BookingDraft {
    pub fn service_ids(&self) -> Vec<i64> {
        self.services.iter().map(|s| s.id).collect()
    }

    pub fn is_reschedule(&self) -> bool {
        self.reschedule_id.is_some()
    }

    /// Creation payload once the deposit has been verified.
    pub fn confirmed_appointment(
        &self,
        provider: PaymentProvider,
        reference: &str,
        split: DepositSplit,
    ) -> NewAppointment {
        NewAppointment {
            service_ids: self.service_ids(),
            date: self.date,
            time: self.time,
            client_name: self.client_name.clone(),
            client_email: self.client_email.clone(),
            client_phone: self.client_phone.clone(),
            notes: self.notes.clone(),
            total_price: self.total_price,
            total_duration: self.total_duration,
            status: AppointmentStatus::Confirmed,
            payment_status: PaymentStatus::DepositPaid,
            payment_provider: provider,
            payment_reference: reference.to_string(),
            deposit_amount: split.deposit,
            remaining_amount: split.remaining,
        }
    }
}
