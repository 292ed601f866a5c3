use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;

use super::Ticks;

/// Identity of a monitored signal: originating source plus point id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementKey {
    pub source: Arc<str>,
    pub id: u32,
}

impl MeasurementKey {
    pub fn new(source: impl Into<Arc<str>>, id: u32) -> Self {
        Self {
            source: source.into(),
            id,
        }
    }
}

impl fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// Quality and state bits carried with every measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementFlags(pub u32);

impl MeasurementFlags {
    pub const NORMAL: MeasurementFlags = MeasurementFlags(0);
    pub const BAD_DATA: MeasurementFlags = MeasurementFlags(1 << 0);
    pub const SUSPECT_DATA: MeasurementFlags = MeasurementFlags(1 << 1);
    pub const OVER_RANGE: MeasurementFlags = MeasurementFlags(1 << 2);
    pub const UNDER_RANGE: MeasurementFlags = MeasurementFlags(1 << 3);
    pub const BAD_TIME: MeasurementFlags = MeasurementFlags(1 << 4);
    pub const SUSPECT_TIME: MeasurementFlags = MeasurementFlags(1 << 5);
    pub const LATE_TIME: MeasurementFlags = MeasurementFlags(1 << 6);
    pub const FUTURE_TIME: MeasurementFlags = MeasurementFlags(1 << 7);
    pub const CALCULATED: MeasurementFlags = MeasurementFlags(1 << 8);
    pub const DISCARDED: MeasurementFlags = MeasurementFlags(1 << 9);

    const QUALITY_MASK: u32 = Self::BAD_DATA.0
        | Self::SUSPECT_DATA.0
        | Self::OVER_RANGE.0
        | Self::UNDER_RANGE.0
        | Self::BAD_TIME.0
        | Self::SUSPECT_TIME.0
        | Self::LATE_TIME.0
        | Self::FUTURE_TIME.0;

    pub fn contains(self, other: MeasurementFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_bad_time(self) -> bool {
        self.contains(Self::BAD_TIME)
    }

    pub fn has_good_quality(self) -> bool {
        self.0 & Self::QUALITY_MASK == 0
    }
}

impl BitOr for MeasurementFlags {
    type Output = MeasurementFlags;

    fn bitor(self, rhs: Self) -> Self {
        MeasurementFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MeasurementFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for MeasurementFlags {
    type Output = MeasurementFlags;

    fn bitand(self, rhs: Self) -> Self {
        MeasurementFlags(self.0 & rhs.0)
    }
}

/// A single timestamped scalar reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub key: MeasurementKey,
    pub timestamp: Ticks,
    pub value: f64,
    #[serde(default)]
    pub flags: MeasurementFlags,
    /// Side-channel information (tag name, units, etc)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Arc<HashMap<String, String>>>,
}

impl Measurement {
    pub fn new(key: MeasurementKey, timestamp: Ticks, value: f64) -> Self {
        Self {
            key,
            timestamp,
            value,
            flags: MeasurementFlags::NORMAL,
            metadata: None,
        }
    }

    pub fn with_flags(mut self, flags: MeasurementFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<HashMap<String, String>>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} @ {}", self.key, self.value, self.timestamp)
    }
}
