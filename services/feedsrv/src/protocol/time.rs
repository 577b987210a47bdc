//! Time-of-day values and their 2-byte wire encoding
//!
//! Feeders count minutes from a reference time of day (16:00 by default).
//! Hours and minutes wrap independently: `((h - oh) mod 24) * 60 + (m - om) mod 60`.

use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Reference time of day the wire encoding counts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOffset")]
pub struct TimeOffset {
    hours: u8,
    minutes: u8,
}

#[derive(Deserialize)]
struct RawOffset {
    #[serde(default)]
    hours: u8,
    #[serde(default)]
    minutes: u8,
}

impl TryFrom<RawOffset> for TimeOffset {
    type Error = ValidationError;

    fn try_from(raw: RawOffset) -> Result<Self, Self::Error> {
        TimeOffset::new(raw.hours, raw.minutes)
    }
}

impl TimeOffset {
    /// The reference used by the feeders in the field
    pub const DEFAULT: TimeOffset = TimeOffset {
        hours: 16,
        minutes: 0,
    };

    pub fn new(hours: u8, minutes: u8) -> Result<Self, ValidationError> {
        if hours > 23 || minutes > 59 {
            return Err(ValidationError::InvalidOffset { hours, minutes });
        }
        Ok(Self { hours, minutes })
    }

    pub fn hours(&self) -> u8 {
        self.hours
    }

    pub fn minutes(&self) -> u8 {
        self.minutes
    }
}

impl Default for TimeOffset {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Time of day with minute precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTime")]
pub struct TimeValue {
    hours: u8,
    minutes: u8,
}

#[derive(Deserialize)]
struct RawTime {
    hours: i64,
    minutes: i64,
}

impl TryFrom<RawTime> for TimeValue {
    type Error = ValidationError;

    fn try_from(raw: RawTime) -> Result<Self, Self::Error> {
        TimeValue::new(raw.hours, raw.minutes)
    }
}

impl TimeValue {
    /// `hours` in [0,23], `minutes` in [0,59]; anything else fails
    pub fn new(hours: i64, minutes: i64) -> Result<Self, ValidationError> {
        if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
            return Err(ValidationError::InvalidTime { hours, minutes });
        }
        Ok(Self {
            hours: hours as u8,
            minutes: minutes as u8,
        })
    }

    /// Parse clock text `HH:MM` or `HH:MM:SS` (seconds are dropped)
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let unparsable = || ValidationError::UnparsableTime(text.to_string());

        let parts: Vec<&str> = text.trim().split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(unparsable());
        }
        let numbers = parts
            .iter()
            .map(|part| part.trim().parse::<i64>().map_err(|_| unparsable()))
            .collect::<Result<Vec<i64>, _>>()?;
        if numbers.get(2).is_some_and(|s| !(0..60).contains(s)) {
            return Err(unparsable());
        }

        Self::new(numbers[0], numbers[1])
    }

    pub fn from_datetime(datetime: &DateTime<Utc>) -> Self {
        Self {
            hours: datetime.hour() as u8,
            minutes: datetime.minute() as u8,
        }
    }

    /// Current UTC wall-clock time
    pub fn now() -> Self {
        Self::from_datetime(&Utc::now())
    }

    pub fn hours(&self) -> u8 {
        self.hours
    }

    pub fn minutes(&self) -> u8 {
        self.minutes
    }

    /// Minutes elapsed since `offset`, wrapped per component
    pub fn minutes_since(&self, offset: TimeOffset) -> u16 {
        let hours = (u16::from(self.hours) + 24 - u16::from(offset.hours)) % 24;
        let minutes = (u16::from(self.minutes) + 60 - u16::from(offset.minutes)) % 60;
        hours * 60 + minutes
    }

    pub fn encode_with_offset(&self, offset: TimeOffset) -> [u8; 2] {
        self.minutes_since(offset).to_be_bytes()
    }

    pub fn encode(&self) -> [u8; 2] {
        self.encode_with_offset(TimeOffset::DEFAULT)
    }

    /// Inverse of [`TimeValue::encode_with_offset`]
    pub fn decode_with_offset(raw: [u8; 2], offset: TimeOffset) -> Result<Self, ValidationError> {
        let value = u16::from_be_bytes(raw);
        if value >= MINUTES_PER_DAY {
            return Err(ValidationError::EncodedTimeOutOfRange(value));
        }
        Ok(Self {
            hours: ((value / 60 + u16::from(offset.hours)) % 24) as u8,
            minutes: ((value % 60 + u16::from(offset.minutes)) % 60) as u8,
        })
    }

    pub fn decode(raw: [u8; 2]) -> Result<Self, ValidationError> {
        Self::decode_with_offset(raw, TimeOffset::DEFAULT)
    }

    /// SQL `TIME` literal, e.g. `07:05:00`
    pub fn to_sql_time(&self) -> String {
        format!("{:02}:{:02}:00", self.hours, self.minutes)
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hours, self.minutes)
    }
}
