use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::ValidationError;

/// RFC3339 timestamp guaranteed to be UTC.
///
/// All pipeline timestamps (snapshot capture instants, slot boundaries,
/// bucket floors) flow through this type so that window arithmetic can
/// never mix offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcInstant(OffsetDateTime);

impl UtcInstant {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let parsed = OffsetDateTime::parse(input, &Rfc3339).map_err(|_| {
            ValidationError::TimestampNotUtc {
                value: input.to_owned(),
            }
        })?;

        Self::from_offset_datetime(parsed).map_err(|_| ValidationError::TimestampNotUtc {
            value: input.to_owned(),
        })
    }

    pub fn from_offset_datetime(value: OffsetDateTime) -> Result<Self, ValidationError> {
        if value.offset() != UtcOffset::UTC {
            return Err(ValidationError::TimestampNotUtc {
                value: value
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| String::from("<unformattable>")),
            });
        }

        Ok(Self(value))
    }

    pub fn from_unix_timestamp(seconds: i64) -> Result<Self, ValidationError> {
        OffsetDateTime::from_unix_timestamp(seconds)
            .map(Self)
            .map_err(|_| ValidationError::TimestampNotUtc {
                value: seconds.to_string(),
            })
    }

    /// Floor to a whole multiple of `bucket_secs` since the Unix epoch.
    ///
    /// Bucket widths divide 86_400, so flooring in epoch space is identical
    /// to flooring within the UTC calendar day.
    pub fn floor_to_seconds(self, bucket_secs: u64) -> Self {
        let secs = self.0.unix_timestamp();
        let width = bucket_secs as i64;
        let floored = secs.div_euclid(width) * width;
        Self(
            OffsetDateTime::from_unix_timestamp(floored)
                .expect("floored epoch seconds stay in range"),
        )
    }

    pub fn date(self) -> Date {
        self.0.date()
    }

    pub fn unix_timestamp(self) -> i64 {
        self.0.unix_timestamp()
    }

    pub fn into_inner(self) -> OffsetDateTime {
        self.0
    }

    pub fn format_rfc3339(self) -> String {
        self.0
            .format(&Rfc3339)
            .expect("UtcInstant must be RFC3339 formattable")
    }
}

impl Add<Duration> for UtcInstant {
    type Output = UtcInstant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<Duration> for UtcInstant {
    type Output = UtcInstant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<UtcInstant> for UtcInstant {
    type Output = Duration;

    fn sub(self, rhs: UtcInstant) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Display for UtcInstant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_rfc3339())
    }
}

impl Serialize for UtcInstant {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.format_rfc3339())
    }
}

impl<'de> Deserialize<'de> for UtcInstant {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(D::Error::custom)
    }
}

/// Format a calendar date as `YYYY-MM-DD` without pulling in the macro
/// feature of `time`.
pub fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
