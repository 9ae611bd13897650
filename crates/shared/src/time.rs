use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const TICKS_PER_MICROSECOND: i64 = 10;

/// Transport timestamp in 100-nanosecond ticks since the Unix epoch.
///
/// Tokens are totally ordered and double as the cursor for backward history
/// pagination. The wall-clock date derived from a token is approximate: the
/// transport assigns tokens, not a calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeToken(i64);

impl TimeToken {
    pub const fn new(ticks: i64) -> Self {
        Self(ticks)
    }

    pub fn now() -> Self {
        Self::from_date(Utc::now())
    }

    pub fn from_date(date: DateTime<Utc>) -> Self {
        Self(date.timestamp_micros().saturating_mul(TICKS_PER_MICROSECOND))
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    pub fn approximate_date(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0 / TICKS_PER_MICROSECOND)
    }
}

impl fmt::Display for TimeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position on the synchronized playback timeline, expressed as the program
/// date time of the media at that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaybackTime(DateTime<Utc>);

impl PlaybackTime {
    pub const fn new(date: DateTime<Utc>) -> Self {
        Self(date)
    }

    pub fn from_timestamp_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    pub fn date(self) -> DateTime<Utc> {
        self.0
    }

    pub fn timestamp_millis(self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn checked_add_millis(self, millis: i64) -> Option<Self> {
        self.0
            .checked_add_signed(chrono::Duration::milliseconds(millis))
            .map(Self)
    }
}

impl From<DateTime<Utc>> for PlaybackTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}
