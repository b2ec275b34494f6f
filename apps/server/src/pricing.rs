//! Price, duration and deposit arithmetic for a booking.
//!
//! Money is kept in exact decimals end to end; the only rounding step is the
//! deposit split, which rounds half away from zero to whole currency units.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Service, ServiceDuration};

/// Share of the total collected online.
pub const DEPOSIT_RATE: Decimal = Decimal::from_parts(20, 0, 0, false, 2);

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid service duration {raw:?}")]
pub struct DurationError {
    pub raw: String,
}

/// Normalize a catalog duration into whole minutes.
///
/// `HH:MM:SS` becomes `hours*60 + minutes + round(seconds/60)`; a leading
/// `D ` day count adds `D*1440`. Integers are already minutes.
pub fn normalized_minutes(duration: &ServiceDuration) -> Result<u32, DurationError> {
    match duration {
        ServiceDuration::Minutes(minutes) => Ok(*minutes),
        ServiceDuration::Clock(raw) => parse_clock(raw).ok_or_else(|| DurationError {
            raw: raw.clone(),
        }),
    }
}

fn parse_clock(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let (days, clock) = match raw.split_once(' ') {
        Some((days, clock)) => (days.parse::<u32>().ok()?, clock),
        None => (0, raw),
    };

    let mut parts = clock.split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: f64 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0.0,
    };
    if parts.next().is_some() || minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }

    let rounded_seconds = (seconds / 60.0).round() as u32;
    days.checked_mul(MINUTES_PER_DAY)?
        .checked_add(hours.checked_mul(60)?)?
        .checked_add(minutes + rounded_seconds)
}

/// Exact sum of service prices.
pub fn total_price(services: &[Service]) -> Decimal {
    services.iter().map(|s| s.price).sum()
}

/// Sum of normalized service durations, in minutes.
pub fn total_duration(services: &[Service]) -> Result<u32, DurationError> {
    services.iter().try_fold(0u32, |total, s| {
        let minutes = normalized_minutes(&s.duration)?;
        total.checked_add(minutes).ok_or_else(|| DurationError {
            raw: format!("{:?}", s.duration),
        })
    })
}

/// Deposit collected online and the balance paid at the appointment.
/// `deposit + remaining == total` holds for every total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositSplit {
    pub total: Decimal,
    pub deposit: Decimal,
    pub remaining: Decimal,
}

impl DepositSplit {
    pub fn from_total(total: Decimal) -> Self {
        let deposit =
            (total * DEPOSIT_RATE).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        Self {
            total,
            deposit,
            remaining: total - deposit,
        }
    }
}

/// Convert a whole-unit amount into the gateway's minor units (kobo, pence).
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}
