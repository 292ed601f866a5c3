use serde::{Deserialize, Serialize};
use std::fmt::Write;

use super::MetricsSnapshot;
use crate::core::{DownsamplingMethod, Measurement, Ticks};
use crate::timing::TimerKey;

/// Point-in-time view of a concentrator's configuration, counters and queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub enabled: bool,
    pub run_time_seconds: f64,
    pub lag_time: f64,
    pub lead_time: f64,
    pub time_resolution: i64,
    pub downsampling_method: DownsamplingMethod,
    pub local_clock_time: Ticks,
    pub use_local_clock_as_real_time: bool,
    /// Seconds between the local clock and the real-time estimate
    pub local_clock_deviation: Option<f64>,
    pub ignore_bad_timestamps: bool,
    pub allow_sorts_by_arrival: bool,
    pub allow_preemptive_publishing: bool,
    pub perform_timestamp_reasonability_check: bool,
    pub process_by_received_timestamp: bool,
    pub expected_measurements_per_frame: usize,
    pub metrics: MetricsSnapshot,
    pub last_discarded_measurement: Option<Measurement>,
    pub last_discarded_latency: Option<f64>,
    pub use_precision_timer: bool,
    pub wait_handle_timeout_ms: u64,
    pub frames_per_second: u32,
    pub ticks_per_frame: f64,
    pub processing_interval: i32,
    pub timer_key: Option<TimerKey>,
    pub timer_reference_count: usize,
    pub total_timers: usize,
    pub queued_frames: usize,
    pub last_published_frame: Option<Ticks>,
    pub last_sorted_measurement: Option<Measurement>,
}

impl StatusReport {
    /// Share of the frame period spent inside the publisher
    pub fn user_function_utilization(&self) -> f64 {
        let publish_ticks = self.metrics.avg_publish_time_us as f64 * Ticks::PER_MICROSECOND as f64;
        publish_ticks / self.ticks_per_frame
    }

    pub fn estimated_mean_frame_rate(&self) -> f64 {
        let elapsed = self.run_time_seconds - self.lag_time;
        if elapsed <= 0.0 {
            0.0
        } else {
            self.metrics.published_frames as f64 / elapsed
        }
    }

    pub fn render(&self) -> String {
        let m = &self.metrics;
        let mut status = String::new();

        let _ = writeln!(status, "     Data concentration is: {}", if self.enabled { "Enabled" } else { "Disabled" });
        let _ = writeln!(status, "    Total process run time: {:.2} seconds", self.run_time_seconds);
        let _ = writeln!(status, "    Measurement wait delay: {} seconds (lag time)", self.lag_time);
        let _ = writeln!(status, "     Local clock tolerance: {} seconds (lead time)", self.lead_time);
        let _ = writeln!(status, "   Maximum time resolution: {} ticks", self.time_resolution);
        let _ = writeln!(status, "      Down-sampling method: {}", self.downsampling_method);
        let _ = writeln!(status, "    Local clock time (UTC): {}", self.local_clock_time);
        let _ = writeln!(status, "  Using clock as real-time: {}", self.use_local_clock_as_real_time);

        if let Some(deviation) = self.local_clock_deviation {
            let _ = writeln!(status, "      Local clock accuracy: {:.4} second deviation from latest time", deviation);
        }

        let _ = writeln!(status, "     Ignore bad timestamps: {}", self.ignore_bad_timestamps);
        let _ = writeln!(status, "    Allow sorts by arrival: {}", self.allow_sorts_by_arrival);
        let _ = writeln!(status, " Use preemptive publishing: {}", self.allow_preemptive_publishing);
        let _ = writeln!(
            status,
            "  Time reasonability check: {}",
            if self.perform_timestamp_reasonability_check { "Enabled" } else { "Disabled" }
        );
        let _ = writeln!(status, "  Process by received time: {}", self.process_by_received_timestamp);
        let _ = writeln!(status, "     Received measurements: {}", m.received_measurements);
        let _ = writeln!(status, "    Processed measurements: {}", m.processed_measurements);
        let _ = writeln!(status, "    Discarded measurements: {}", m.discarded_measurements);
        let _ = writeln!(status, " Down-sampled measurements: {}", m.downsampled_measurements);
        let _ = writeln!(status, "    Published measurements: {}", m.published_measurements);
        let _ = writeln!(
            status,
            "     Expected measurements: {} ({} / frame)",
            m.published_frames * self.expected_measurements_per_frame as u64,
            self.expected_measurements_per_frame
        );

        match &self.last_discarded_measurement {
            Some(measurement) => {
                let _ = writeln!(status, "Last discarded measurement: {} - {}", measurement.key, measurement.timestamp);
                let _ = writeln!(
                    status,
                    " Latency of last discarded: {:.4} seconds",
                    self.last_discarded_latency.unwrap_or_default()
                );
            }
            None => {
                let _ = writeln!(status, "Last discarded measurement: <none>");
            }
        }

        let _ = writeln!(status, "  Average publication time: {:.4} milliseconds", m.avg_publish_time_us as f64 / 1000.0);
        let _ = writeln!(status, "  Pre-lag-time publication: {:.4}%", m.pre_lag_publication * 100.0);
        let _ = writeln!(status, " Down-sampling application: {:.4}%", m.downsampling_application * 100.0);
        let _ = writeln!(
            status,
            " User function utilization: {:.4}% of available time used",
            self.user_function_utilization() * 100.0
        );
        let _ = writeln!(status, "Published measurement loss: {:.4}%", m.published_measurement_loss * 100.0);
        let _ = writeln!(status, "    Total sorts by arrival: {}", m.measurements_sorted_by_arrival);
        let _ = writeln!(status, " Measurement time accuracy: {:.4}%", m.measurement_time_accuracy * 100.0);
        let _ = writeln!(status, "   Missed sorts by timeout: {}", m.missed_sorts_by_timeout);
        let _ = writeln!(status, "      Loss due to timeouts: {:.4}%", m.loss_due_to_timeouts * 100.0);
        let _ = writeln!(status, "     Using precision timer: {}", self.use_precision_timer);
        let _ = writeln!(status, "       Wait handle timeout: {} milliseconds", self.wait_handle_timeout_ms);
        let _ = writeln!(status, "   Wait handle expirations: {}", m.wait_handle_expirations);
        let _ = writeln!(status, "    Total published frames: {}", m.published_frames);
        let _ = writeln!(
            status,
            "        Defined frame rate: {} frames/sec, {:.2} ticks/frame",
            self.frames_per_second, self.ticks_per_frame
        );
        let _ = writeln!(status, " Estimated mean frame rate: {:.2} frames/sec", self.estimated_mean_frame_rate());

        let interval = match self.processing_interval {
            interval if interval < 0 => format!("{:.2} milliseconds", self.ticks_per_frame / Ticks::PER_MILLISECOND as f64),
            0 => "As fast as possible".to_string(),
            interval => format!("{} milliseconds", interval),
        };
        let _ = writeln!(status, "       Processing interval: {}", interval);

        if let Some(key) = self.timer_key {
            if self.timer_reference_count > 0 {
                let _ = writeln!(
                    status,
                    "     Timer reference count: {} concentrator{} for the {} timer",
                    self.timer_reference_count,
                    if self.timer_reference_count > 1 { "s" } else { "" },
                    key
                );
            }
        }

        let _ = writeln!(status, "   Total frame rate timers: {}", self.total_timers);
        let _ = writeln!(status, "        Queued frame count: {}", self.queued_frames);

        match self.last_published_frame {
            Some(timestamp) => {
                let _ = writeln!(status, "      Last published frame: {}", timestamp);
                let last_sorted = self
                    .last_sorted_measurement
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "<none>".to_string());
                let _ = writeln!(status, "   Last sorted measurement: {}", last_sorted);
            }
            None => {
                let _ = writeln!(status, "      Last published frame: <none>");
            }
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::ConcentratorMetrics;

    fn report() -> StatusReport {
        StatusReport {
            enabled: true,
            run_time_seconds: 13.0,
            lag_time: 3.0,
            lead_time: 1.0,
            time_resolution: 0,
            downsampling_method: DownsamplingMethod::Closest,
            local_clock_time: Ticks(0),
            use_local_clock_as_real_time: false,
            local_clock_deviation: Some(0.25),
            ignore_bad_timestamps: false,
            allow_sorts_by_arrival: true,
            allow_preemptive_publishing: false,
            perform_timestamp_reasonability_check: true,
            process_by_received_timestamp: false,
            expected_measurements_per_frame: 2,
            metrics: ConcentratorMetrics::new().snapshot(),
            last_discarded_measurement: None,
            last_discarded_latency: None,
            use_precision_timer: true,
            wait_handle_timeout_ms: 40,
            frames_per_second: 30,
            ticks_per_frame: 333_333.33,
            processing_interval: -1,
            timer_key: Some(TimerKey::new(30, -1)),
            timer_reference_count: 2,
            total_timers: 1,
            queued_frames: 90,
            last_published_frame: None,
            last_sorted_measurement: None,
        }
    }

    #[test]
    fn test_render_contains_key_lines() {
        let text = report().render();

        assert!(text.contains("     Data concentration is: Enabled"));
        assert!(text.contains("      Down-sampling method: Closest"));
        assert!(text.contains("      Local clock accuracy: 0.2500 second deviation from latest time"));
        assert!(text.contains("Last discarded measurement: <none>"));
        assert!(text.contains("       Processing interval: 33.33 milliseconds"));
        assert!(text.contains("     Timer reference count: 2 concentrators for the 30fps @ 33.33ms timer"));
        assert!(text.contains("        Queued frame count: 90"));
        assert!(text.contains("      Last published frame: <none>"));
    }

    #[test]
    fn test_mean_frame_rate_excludes_lag() {
        let mut status = report();
        status.metrics.published_frames = 300;
        assert_eq!(status.estimated_mean_frame_rate(), 30.0);

        status.run_time_seconds = 2.0;
        assert_eq!(status.estimated_mean_frame_rate(), 0.0);
    }
}
