use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed-point timestamp: 100-nanosecond intervals since the Unix epoch (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticks(pub i64);

impl Ticks {
    pub const PER_SECOND: i64 = 10_000_000;
    pub const PER_MILLISECOND: i64 = 10_000;
    pub const PER_MICROSECOND: i64 = 10;
    pub const ZERO: Ticks = Ticks(0);

    /// Current system time
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Ticks((elapsed.as_nanos() / 100) as i64),
            Err(before) => Ticks(-((before.duration().as_nanos() / 100) as i64)),
        }
    }

    pub fn from_seconds(seconds: f64) -> Self {
        Ticks((seconds * Self::PER_SECOND as f64).round() as i64)
    }

    pub fn from_millis(millis: i64) -> Self {
        Ticks(millis * Self::PER_MILLISECOND)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / Self::PER_SECOND as f64
    }

    pub fn to_millis(self) -> f64 {
        self.0 as f64 / Self::PER_MILLISECOND as f64
    }

    /// Timestamp floored to the start of its whole second
    pub fn base_second(self) -> Ticks {
        Ticks(self.0 - self.0.rem_euclid(Self::PER_SECOND))
    }

    /// Ticks elapsed since the start of the second
    pub fn distance_beyond_second(self) -> i64 {
        self.0.rem_euclid(Self::PER_SECOND)
    }

    /// True when this timestamp falls within `[now - lag, now + lead]`
    pub fn time_is_valid(self, now: Ticks, lag_seconds: f64, lead_seconds: f64) -> bool {
        let distance = (now.0 - self.0) as f64 / Self::PER_SECOND as f64;
        distance >= -lead_seconds && distance <= lag_seconds
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let seconds = self.0.div_euclid(Self::PER_SECOND);
        let nanos = (self.0.rem_euclid(Self::PER_SECOND) * 100) as u32;
        DateTime::from_timestamp(seconds, nanos)
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(time) => write!(f, "{}", time.format("%d-%b-%Y %H:%M:%S%.3f")),
            None => write!(f, "{} ticks", self.0),
        }
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0 + rhs.0)
    }
}

impl Sub for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0 - rhs.0)
    }
}

impl From<i64> for Ticks {
    fn from(value: i64) -> Self {
        Ticks(value)
    }
}
