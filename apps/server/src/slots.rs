//! Day slot grid and the per-session slot feed.

use chrono::{Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::models::{DaySlots, SlotReason, TimeSlot};

// ── Constants ──

/// First bookable start time.
const OPENING_HOUR: u32 = 9;
/// Closing time; the last slot starts one step before it.
const CLOSING_HOUR: u32 = 17;
/// Slot length in minutes.
const SLOT_STEP_MIN: i64 = 30;

/// Business-local wall clock. Slots are compared against it, not against UTC.
#[derive(Debug, Clone, Copy)]
pub struct BusinessClock {
    offset: FixedOffset,
}

impl BusinessClock {
    pub fn new(offset_minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(offset_minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    pub fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// Compute the slot grid for `date`.
///
/// Always 16 slots, 09:00 through 16:30. Booked times are matched on hour and
/// minute only; a booked slot reports "Already booked" even when it is also
/// in the past.
pub fn slots_for_day(date: NaiveDate, booked_times: &[NaiveTime], now: NaiveDateTime) -> DaySlots {
    let opening = date.and_time(NaiveTime::default()) + Duration::hours(i64::from(OPENING_HOUR));
    let closing = date.and_time(NaiveTime::default()) + Duration::hours(i64::from(CLOSING_HOUR));

    let mut slots = Vec::new();
    let mut current = opening;
    while current < closing {
        let time = current.time();
        let booked = booked_times
            .iter()
            .any(|b| b.hour() == time.hour() && b.minute() == time.minute());

        let reason = if booked {
            Some(SlotReason::AlreadyBooked)
        } else if current <= now {
            Some(SlotReason::InThePast)
        } else {
            None
        };

        slots.push(TimeSlot {
            time,
            available: reason.is_none(),
            reason,
        });
        current += Duration::minutes(SLOT_STEP_MIN);
    }

    DaySlots { date, slots }
}

// ── Slot feed ──

/// The visible slot list of one session.
///
/// Every `load` re-fetches booked times for its date. A response is applied
/// only if no newer `load` (or `clear`) started after it, so a slow fetch for
/// an abandoned date can never overwrite the list for the current one.
#[derive(Debug, Default)]
pub struct SlotFeed {
    generation: AtomicU64,
    current: Mutex<Option<DaySlots>>,
}

impl SlotFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch and apply the grid for `date`. Returns `Ok(None)` when the
    /// response was superseded and dropped.
    pub async fn load<F, Fut, E>(
        &self,
        date: NaiveDate,
        now: NaiveDateTime,
        fetch: F,
    ) -> Result<Option<DaySlots>, E>
    where
        F: FnOnce(NaiveDate) -> Fut,
        Fut: Future<Output = Result<Vec<NaiveTime>, E>>,
    {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let result = fetch(date).await;

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != ticket {
            tracing::debug!("Dropping stale slot response for {}", date);
            return Ok(None);
        }

        let day = slots_for_day(date, &result?, now);
        *current = Some(day.clone());
        Ok(Some(day))
    }

    /// The last applied grid, if any.
    pub fn current(&self) -> Option<DaySlots> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear down the view; in-flight responses are dropped.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
