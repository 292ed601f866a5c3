use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::FrameAlignment;
use crate::core::{DownsamplingMethod, Ticks};
use crate::timing::TimerKey;

/// Rejected concentrator configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("frames per second must be greater than 0")]
    InvalidFrameRate,

    #[error("lag time must be greater than zero, got {0} seconds")]
    InvalidLagTime(f64),

    #[error("lead time must be greater than zero, got {0} seconds")]
    InvalidLeadTime(f64),

    #[error("a precision timer must be used when a processing interval of {0} ms has been defined")]
    TimerRequired(i32),

    #[error("the filtered down-sampling method requires a measurement filter")]
    FilterRequired,

    #[error("maximum publication timeout must be at least 1 ms")]
    InvalidPublicationTimeout,

    #[error("invalid concentrator configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// User-facing concentrator configuration
///
/// Every field has a default so partial JSON documents deserialize. Call [`validate`] to
/// obtain normalized [`Settings`].
///
/// [`validate`]: ConcentratorConfig::validate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcentratorConfig {
    pub frames_per_second: u32,
    /// Seconds to wait past a frame's timestamp for late data
    pub lag_time: f64,
    /// Seconds of tolerated local clock inaccuracy
    pub lead_time: f64,
    /// -1 derives the period from the frame rate, 0 processes as fast as possible,
    /// positive values are a fixed period in milliseconds
    pub processing_interval: i32,
    pub expected_measurements_per_frame: usize,
    pub allow_preemptive_publishing: bool,
    pub downsampling_method: DownsamplingMethod,
    pub ignore_bad_timestamps: bool,
    pub allow_sorts_by_arrival: bool,
    pub use_local_clock_as_real_time: bool,
    pub perform_timestamp_reasonability_check: bool,
    pub process_by_received_timestamp: bool,
    pub round_to_nearest_timestamp: bool,
    /// Ticks; sub-resolution differences collapse into one frame
    pub time_resolution: i64,
    pub use_precision_timer: bool,
    pub maximum_publication_timeout_ms: Option<u64>,
    pub track_latest_measurements: bool,
    pub unpublished_monitor_interval_ms: u64,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            frames_per_second: 30,
            lag_time: 3.0,
            lead_time: 1.0,
            processing_interval: -1,
            expected_measurements_per_frame: 0,
            allow_preemptive_publishing: true,
            downsampling_method: DownsamplingMethod::LastReceived,
            ignore_bad_timestamps: false,
            allow_sorts_by_arrival: true,
            use_local_clock_as_real_time: false,
            perform_timestamp_reasonability_check: true,
            process_by_received_timestamp: false,
            round_to_nearest_timestamp: false,
            time_resolution: 0,
            use_precision_timer: true,
            maximum_publication_timeout_ms: None,
            track_latest_measurements: false,
            unpublished_monitor_interval_ms: 5000,
        }
    }
}

impl ConcentratorConfig {
    pub fn new(frames_per_second: u32, lag_time: f64, lead_time: f64) -> Self {
        Self {
            frames_per_second,
            lag_time,
            lead_time,
            ..Self::default()
        }
    }

    pub fn from_json(config: Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(config)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .context(format!("Failed to read concentrator config from {:?}", path))?;

        let config: Self = serde_json::from_str(&json)
            .context(format!("Failed to parse concentrator config from {:?}", path))?;

        Ok(config)
    }

    /// Check the configuration and resolve the interdependent flags
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        if self.frames_per_second == 0 {
            return Err(ConfigError::InvalidFrameRate);
        }
        if !(self.lag_time > 0.0 && self.lag_time.is_finite()) {
            return Err(ConfigError::InvalidLagTime(self.lag_time));
        }
        if !(self.lead_time > 0.0 && self.lead_time.is_finite()) {
            return Err(ConfigError::InvalidLeadTime(self.lead_time));
        }

        let processing_interval = self.processing_interval.max(-1);

        let use_precision_timer = match processing_interval {
            0 => false,
            interval if interval > 0 && !self.use_precision_timer => {
                return Err(ConfigError::TimerRequired(interval));
            }
            _ => self.use_precision_timer,
        };

        // Any explicit interval means bulk processing by arrival order
        let process_by_received_timestamp =
            self.process_by_received_timestamp || processing_interval > -1;

        let (use_local_clock_as_real_time, allow_sorts_by_arrival) = if process_by_received_timestamp {
            (true, false)
        } else {
            (self.use_local_clock_as_real_time, self.allow_sorts_by_arrival)
        };

        let ticks_per_frame = Ticks::PER_SECOND as f64 / self.frames_per_second as f64;

        let maximum_publication_timeout = match self.maximum_publication_timeout_ms {
            Some(0) => return Err(ConfigError::InvalidPublicationTimeout),
            Some(ms) => ms,
            None => ((ticks_per_frame * 1.2 / Ticks::PER_MILLISECOND as f64).round() as u64).max(1),
        };

        let time_resolution = self.time_resolution.clamp(0, Ticks::PER_SECOND);
        let time_offset = if time_resolution > 1 { time_resolution / 2 } else { 1 };

        Ok(Settings {
            frames_per_second: self.frames_per_second,
            lag_time: self.lag_time,
            lead_time: self.lead_time,
            lag_ticks: (self.lag_time * Ticks::PER_SECOND as f64) as i64,
            lead_ticks: (self.lead_time * Ticks::PER_SECOND as f64) as i64,
            processing_interval,
            expected_measurements_per_frame: self.expected_measurements_per_frame,
            allow_preemptive_publishing: self.allow_preemptive_publishing,
            downsampling_method: self.downsampling_method,
            ignore_bad_timestamps: self.ignore_bad_timestamps,
            allow_sorts_by_arrival,
            use_local_clock_as_real_time,
            perform_timestamp_reasonability_check: self.perform_timestamp_reasonability_check,
            process_by_received_timestamp,
            round_to_nearest_timestamp: self.round_to_nearest_timestamp,
            time_resolution,
            time_offset,
            ticks_per_frame,
            use_precision_timer,
            maximum_publication_timeout: Duration::from_millis(maximum_publication_timeout),
            track_latest_measurements: self.track_latest_measurements,
            unpublished_monitor_interval: Duration::from_millis(self.unpublished_monitor_interval_ms.max(1)),
        })
    }
}

/// Validated, normalized configuration the engine runs on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub frames_per_second: u32,
    pub lag_time: f64,
    pub lead_time: f64,
    pub lag_ticks: i64,
    pub lead_ticks: i64,
    pub processing_interval: i32,
    pub expected_measurements_per_frame: usize,
    pub allow_preemptive_publishing: bool,
    pub downsampling_method: DownsamplingMethod,
    pub ignore_bad_timestamps: bool,
    pub allow_sorts_by_arrival: bool,
    pub use_local_clock_as_real_time: bool,
    pub perform_timestamp_reasonability_check: bool,
    pub process_by_received_timestamp: bool,
    pub round_to_nearest_timestamp: bool,
    pub time_resolution: i64,
    /// Half the time resolution (or one tick), added before computing the frame index
    pub time_offset: i64,
    pub ticks_per_frame: f64,
    pub use_precision_timer: bool,
    pub maximum_publication_timeout: Duration,
    pub track_latest_measurements: bool,
    pub unpublished_monitor_interval: Duration,
}

impl Settings {
    /// Key of the shared timer this configuration attaches to, if it uses one
    pub fn timer_key(&self) -> Option<TimerKey> {
        self.use_precision_timer
            .then(|| TimerKey::new(self.frames_per_second, self.processing_interval))
    }

    pub fn alignment(&self) -> FrameAlignment {
        FrameAlignment::new(
            self.frames_per_second,
            self.time_resolution,
            self.round_to_nearest_timestamp,
        )
    }

    /// Position of a frame timestamp within its second
    pub fn frame_index(&self, timestamp: Ticks) -> usize {
        ((timestamp.distance_beyond_second() + self.time_offset) as f64 / self.ticks_per_frame) as usize
    }
}
