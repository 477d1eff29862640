use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::domain::timestamp::format_date;
use crate::{UtcInstant, ValidationError};

/// Fixed wall-clock partition window, anchored at 00:00 UTC.
///
/// A width of 8 hours yields slot starts at 00:00, 08:00 and 16:00 UTC;
/// any width that divides the day evenly is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlotSpec {
    width_hours: u8,
}

impl SlotSpec {
    pub fn new(width_hours: u8) -> Result<Self, ValidationError> {
        if width_hours == 0 || 24 % width_hours != 0 {
            return Err(ValidationError::InvalidSlotWidth { hours: width_hours });
        }
        Ok(Self { width_hours })
    }

    pub fn width_hours(self) -> u8 {
        self.width_hours
    }

    pub fn width(self) -> Duration {
        Duration::hours(i64::from(self.width_hours))
    }

    /// Start of the slot containing `ts`.
    pub fn slot_start(self, ts: UtcInstant) -> UtcInstant {
        ts.floor_to_seconds(u64::from(self.width_hours) * 3600)
    }

    /// Exclusive end of the slot containing `ts`.
    pub fn slot_end(self, ts: UtcInstant) -> UtcInstant {
        self.slot_start(ts) + self.width()
    }

    pub fn same_slot(self, a: UtcInstant, b: UtcInstant) -> bool {
        self.slot_start(a) == self.slot_start(b)
    }

    /// Partition label for the slot containing `ts`: `YYYY-MM-DD_HH`.
    pub fn label(self, ts: UtcInstant) -> SlotLabel {
        let start = self.slot_start(ts);
        SlotLabel { start }
    }
}

impl TryFrom<u8> for SlotSpec {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SlotSpec> for u8 {
    fn from(value: SlotSpec) -> Self {
        value.width_hours
    }
}

/// Identity of one partition slot, formatted as `YYYY-MM-DD_HH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotLabel {
    start: UtcInstant,
}

impl SlotLabel {
    pub fn start(self) -> UtcInstant {
        self.start
    }

    /// Parse a `YYYY-MM-DD_HH` partition label, e.g. a file stem produced
    /// by [`SlotSpec::label`].
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidSlotLabel {
            value: input.to_owned(),
        };

        let (date_part, hour_part) = input.split_once('_').ok_or_else(invalid)?;
        let mut date_fields = date_part.splitn(3, '-');
        let year: i32 = date_fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        let month: u8 = date_fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        let day: u8 = date_fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        let hour: u8 = hour_part.parse().map_err(|_| invalid())?;

        let month = time::Month::try_from(month).map_err(|_| invalid())?;
        let date = time::Date::from_calendar_date(year, month, day).map_err(|_| invalid())?;
        let time = time::Time::from_hms(hour, 0, 0).map_err(|_| invalid())?;
        let start = UtcInstant::from_offset_datetime(date.with_time(time).assume_utc())
            .map_err(|_| invalid())?;

        Ok(Self { start })
    }
}

impl Display for SlotLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.start.into_inner();
        write!(f, "{}_{:02}", format_date(inner.date()), inner.hour())
    }
}
