//! The 365-slot content calendar.
//!
//! Every subscriber walks the same fixed rotation of 365 designs; this module
//! owns the day-of-year arithmetic that keeps renewals contiguous across the
//! wraparound at day 365.

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Number of slots in the content rotation. Day 366 does not exist; leap day
/// consumes slot 365.
pub const CALENDAR_DAYS: u16 = 365;

/// Calendar slot identifier, 1-365.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayOfYear(u16);

impl DayOfYear {
    pub fn new(day: u16) -> Result<Self, DomainError> {
        if day == 0 || day > CALENDAR_DAYS {
            return Err(DomainError::validation(format!(
                "day of year must be 1-{CALENDAR_DAYS}, got {day}"
            )));
        }
        Ok(Self(day))
    }

    /// Slot for a calendar date. Ordinal 366 clamps to 365.
    pub fn from_date(date: NaiveDate) -> Self {
        Self((date.ordinal() as u16).min(CALENDAR_DAYS))
    }

    pub fn today() -> Self {
        Self::from_date(Utc::now().date_naive())
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Slot reached `offset` days after this one, wrapping past day 365.
    pub fn advance(self, offset: u32) -> Self {
        Self((((self.0 as u32 - 1 + offset) % CALENDAR_DAYS as u32) + 1) as u16)
    }

    /// Slot the next batch starts at when this slot was the last one mailed.
    pub fn next(self) -> Self {
        self.advance(1)
    }

    /// Last slot consumed by a batch of `duration` days starting here.
    ///
    /// `duration` must be at least 1; a batch always consumes its start slot.
    pub fn last_of_batch(self, duration: u32) -> Self {
        self.advance(duration.saturating_sub(1))
    }

    /// The slot sequence a batch of `duration` days walks, in mail order.
    pub fn batch_days(self, duration: u32) -> impl Iterator<Item = DayOfYear> {
        (0..duration).map(move |i| self.advance(i))
    }
}

impl std::fmt::Display for DayOfYear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DayOfYear {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let day: u16 = s
            .trim()
            .parse()
            .map_err(|_| DomainError::invalid_metadata(format!("not a day of year: {s:?}")))?;
        Self::new(day)
    }
}
