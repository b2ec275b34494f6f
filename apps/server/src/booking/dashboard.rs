//! Appointment listings as the dashboards show them.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::models::{Appointment, AppointmentStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppointmentBoard {
    /// Soonest first.
    pub upcoming: Vec<Appointment>,
    /// Most recent first.
    pub past: Vec<Appointment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub cancelled: usize,
}

fn starts_at(appointment: &Appointment) -> NaiveDateTime {
    appointment.date.and_time(appointment.time)
}

/// Cancelled appointments are history regardless of their date.
pub fn is_past(appointment: &Appointment, now: NaiveDateTime) -> bool {
    appointment.status == AppointmentStatus::Cancelled || starts_at(appointment) <= now
}

pub fn partition(
    appointments: Vec<Appointment>,
    status: Option<AppointmentStatus>,
    now: NaiveDateTime,
) -> AppointmentBoard {
    let (mut past, mut upcoming): (Vec<_>, Vec<_>) = appointments
        .into_iter()
        .filter(|a| status.is_none_or(|s| a.status == s))
        .partition(|a| is_past(a, now));

    upcoming.sort_by_key(starts_at);
    past.sort_by_key(|a| std::cmp::Reverse(starts_at(a)));
    AppointmentBoard { upcoming, past }
}

pub fn summarize(appointments: &[Appointment]) -> StatusSummary {
    appointments
        .iter()
        .fold(StatusSummary::default(), |mut summary, a| {
            summary.total += 1;
            match a.status {
                AppointmentStatus::Pending => summary.pending += 1,
                AppointmentStatus::Confirmed | AppointmentStatus::Rescheduled => {
                    summary.confirmed += 1
                }
                AppointmentStatus::Cancelled => summary.cancelled += 1,
            }
            summary
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::confirmed_appointment;
    use chrono::{NaiveDate, NaiveTime};

    fn at(id: i64, day: u32, hour: u32, status: AppointmentStatus) -> Appointment {
        let mut a = confirmed_appointment(id);
        a.date = NaiveDate::from_ymd_opt(2030, 5, day).unwrap();
        a.time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap();
        a.status = status;
        a
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 5, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_partition_by_start_and_cancellation() {
        let board = partition(
            vec![
                at(1, 12, 9, AppointmentStatus::Confirmed),
                at(2, 8, 9, AppointmentStatus::Confirmed),
                at(3, 11, 9, AppointmentStatus::Pending),
                at(4, 20, 9, AppointmentStatus::Cancelled),
                at(5, 10, 12, AppointmentStatus::Confirmed),
            ],
            None,
            now(),
        );

        let ids = |v: &[Appointment]| v.iter().map(|a| a.id).collect::<Vec<_>>();
        assert_eq!(ids(&board.upcoming), vec![3, 1]);
        assert_eq!(ids(&board.past), vec![4, 5, 2]);
    }

    #[test]
    fn test_partition_filters_status() {
        let board = partition(
            vec![
                at(1, 12, 9, AppointmentStatus::Confirmed),
                at(2, 13, 9, AppointmentStatus::Pending),
            ],
            Some(AppointmentStatus::Pending),
            now(),
        );
        assert_eq!(board.upcoming.len(), 1);
        assert_eq!(board.upcoming[0].id, 2);
        assert!(board.past.is_empty());
    }

    #[test]
    fn test_rescheduled_counts_as_confirmed() {
        let summary = summarize(&[
            at(1, 12, 9, AppointmentStatus::Confirmed),
            at(2, 12, 10, AppointmentStatus::Rescheduled),
            at(3, 12, 11, AppointmentStatus::Pending),
            at(4, 12, 12, AppointmentStatus::Cancelled),
        ]);
        assert_eq!(
            summary,
            StatusSummary {
                total: 4,
                pending: 1,
                confirmed: 2,
                cancelled: 1,
            }
        );
    }
}
