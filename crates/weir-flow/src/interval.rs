//! Event-time lot keys.
//!
//! Boundaries that batch by arrival window rather than by directory derive the
//! lot key from the event time. Keys are `yyyyMMdd`, then the ISO-8601
//! interval length, then the 3-digit ordinal of the interval within the UTC
//! day, so `2023-01-01T03:05Z` in fifteen-minute lots is `20230101PT15M012`.
//! Daily lots are just `yyyyMMdd`.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use weir_core::id::LotKey;

use crate::error::Result;

/// Width of an event-time lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotInterval {
    /// Five-minute lots (288 per day).
    FiveMinutes,
    /// Ten-minute lots (144 per day).
    TenMinutes,
    /// Fifteen-minute lots (96 per day).
    FifteenMinutes,
    /// Hourly lots (24 per day).
    Hourly,
    /// One lot per UTC day.
    Daily,
}

impl LotInterval {
    /// Returns the interval length in minutes.
    #[must_use]
    pub const fn minutes(self) -> u32 {
        match self {
            Self::FiveMinutes => 5,
            Self::TenMinutes => 10,
            Self::FifteenMinutes => 15,
            Self::Hourly => 60,
            Self::Daily => 24 * 60,
        }
    }

    const fn iso_duration(self) -> &'static str {
        match self {
            Self::FiveMinutes => "PT5M",
            Self::TenMinutes => "PT10M",
            Self::FifteenMinutes => "PT15M",
            Self::Hourly => "PT1H",
            Self::Daily => "P1D",
        }
    }

    /// Returns the start of the interval containing `at`.
    #[must_use]
    pub fn truncate(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let day_start = at.date_naive().and_time(chrono::NaiveTime::MIN).and_utc();
        let ordinal = self.ordinal(at);
        day_start + chrono::Duration::minutes(i64::from(ordinal * self.minutes()))
    }

    fn ordinal(self, at: DateTime<Utc>) -> u32 {
        let minute_of_day = at.hour() * 60 + at.minute();
        minute_of_day / self.minutes()
    }

    /// Formats the lot key for the interval containing `at`.
    ///
    /// # Errors
    ///
    /// Never fails for valid timestamps; the result is validated as a lot key.
    pub fn lot_key(self, at: DateTime<Utc>) -> Result<LotKey> {
        let day = at.format("%Y%m%d");
        let key = match self {
            Self::Daily => day.to_string(),
            _ => format!("{day}{}{:03}", self.iso_duration(), self.ordinal(at)),
        };
        Ok(LotKey::new(key)?)
    }
}
