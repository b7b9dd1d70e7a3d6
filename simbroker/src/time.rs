//! Simulation time: millisecond timestamps and bar periods.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

use crate::error::SimError;

const MS_PER_SEC: i64 = 1000;
const MS_PER_DAY: i64 = 86_400 * MS_PER_SEC;

/// Milliseconds since 1970-01-01 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DateTimeMs(pub i64);

impl DateTimeMs {
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * MS_PER_SEC)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Whole seconds since the epoch.
    pub fn unix_secs(self) -> i64 {
        self.0.div_euclid(MS_PER_SEC)
    }

    /// Millisecond part, 0..999.
    pub fn millisecond(self) -> i64 {
        self.0.rem_euclid(MS_PER_SEC)
    }

    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }

    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    /// Parses `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` (UTC) or RFC 3339.
    pub fn parse(s: &str) -> Result<Self, SimError> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self(dt.timestamp_millis()));
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Ok(Self(ndt.and_utc().timestamp_millis()));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(ndt) = d.and_hms_opt(0, 0, 0) {
                return Ok(Self(ndt.and_utc().timestamp_millis()));
            }
        }
        Err(SimError::Config(format!("bad timestamp: {s}")))
    }
}

impl fmt::Display for DateTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_utc() {
            Some(dt) => write!(f, "{}", dt.format("%y-%m-%d %H:%M:%S%.3f")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl Add<i64> for DateTimeMs {
    type Output = DateTimeMs;

    fn add(self, ms: i64) -> DateTimeMs {
        DateTimeMs(self.0 + ms)
    }
}

impl Sub for DateTimeMs {
    type Output = i64;

    fn sub(self, rhs: DateTimeMs) -> i64 {
        self.0 - rhs.0
    }
}

/// Bar length. Discriminants are the length in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Period {
    Min1 = 60,
    Min3 = 180,
    Min5 = 300,
    Min15 = 900,
    Min30 = 1800,
    Hour1 = 3600,
    Hour2 = 7200,
    Hour4 = 14400,
    Hour8 = 28800,
    Daily = 86400,
    Weekly = 604800,
    Monthly = 2592000, // nominal 30 days, boundaries follow the calendar
}

impl Period {
    pub const ALL: [Period; 12] = [
        Period::Min1,
        Period::Min3,
        Period::Min5,
        Period::Min15,
        Period::Min30,
        Period::Hour1,
        Period::Hour2,
        Period::Hour4,
        Period::Hour8,
        Period::Daily,
        Period::Weekly,
        Period::Monthly,
    ];

    pub fn secs(self) -> i64 {
        self as i64
    }

    pub fn millis(self) -> i64 {
        self.secs() * MS_PER_SEC
    }

    pub fn from_secs(secs: i64) -> Option<Period> {
        Period::ALL.into_iter().find(|p| p.secs() == secs)
    }

    pub fn is_intraday(self) -> bool {
        self < Period::Daily
    }

    /// Start of the period containing `t`.
    pub fn floor(self, t: DateTimeMs) -> DateTimeMs {
        match self {
            Period::Weekly => {
                let day = Period::Daily.floor(t);
                let wday = day
                    .to_utc()
                    .map(|d| d.weekday().num_days_from_sunday() as i64)
                    .unwrap_or(0);
                day + -(wday * MS_PER_DAY)
            }
            Period::Monthly => match t.to_utc() {
                Some(d) => month_start(d.year(), d.month()).unwrap_or(Period::Daily.floor(t)),
                None => Period::Daily.floor(t),
            },
            _ => {
                let len = self.millis();
                DateTimeMs(t.0 - t.0.rem_euclid(len))
            }
        }
    }

    /// Start of the period following the one containing `t`.
    pub fn next_boundary(self, t: DateTimeMs) -> DateTimeMs {
        match self {
            Period::Weekly => self.floor(t) + 7 * MS_PER_DAY,
            Period::Monthly => {
                let start = self.floor(t);
                match start.to_utc() {
                    Some(d) => {
                        let (y, m) = if d.month() == 12 { (d.year() + 1, 1) } else { (d.year(), d.month() + 1) };
                        month_start(y, m).unwrap_or(start + self.millis())
                    }
                    None => start + self.millis(),
                }
            }
            _ => self.floor(t) + self.millis(),
        }
    }
}

fn month_start(year: i32, month: u32) -> Option<DateTimeMs> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(DateTimeMs::from_utc)
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
