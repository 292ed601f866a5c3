use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Concentration counters, updated concurrently by sorting threads and the publisher
#[derive(Debug, Default)]
pub struct ConcentratorMetrics {
    received_measurements: AtomicU64,
    processed_measurements: AtomicU64,
    discarded_measurements: AtomicU64,
    measurements_sorted_by_arrival: AtomicU64,
    published_measurements: AtomicU64,
    downsampled_measurements: AtomicU64,
    missed_sorts_by_timeout: AtomicU64,
    wait_handle_expirations: AtomicU64,
    frames_ahead_of_schedule: AtomicU64,
    published_frames: AtomicU64,
    total_publish_time_us: AtomicU64,
}

impl ConcentratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, count: u64) {
        self.received_measurements.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed_measurements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.discarded_measurements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sorted_by_arrival(&self) {
        self.measurements_sorted_by_arrival.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missed_sort(&self) {
        self.missed_sorts_by_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_handle_expiration(&self) {
        self.wait_handle_expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_ahead_of_schedule(&self) {
        self.frames_ahead_of_schedule.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_publication(&self) -> Instant {
        Instant::now()
    }

    /// Account for one published frame and the time spent publishing it
    pub fn finish_publication(&self, start: Instant, measurements: u64, downsampled: u64) {
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.published_frames.fetch_add(1, Ordering::Relaxed);
        self.published_measurements.fetch_add(measurements, Ordering::Relaxed);
        self.downsampled_measurements.fetch_add(downsampled, Ordering::Relaxed);
        self.total_publish_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn received_measurements(&self) -> u64 {
        self.received_measurements.load(Ordering::Relaxed)
    }

    pub fn processed_measurements(&self) -> u64 {
        self.processed_measurements.load(Ordering::Relaxed)
    }

    pub fn discarded_measurements(&self) -> u64 {
        self.discarded_measurements.load(Ordering::Relaxed)
    }

    pub fn measurements_sorted_by_arrival(&self) -> u64 {
        self.measurements_sorted_by_arrival.load(Ordering::Relaxed)
    }

    pub fn published_measurements(&self) -> u64 {
        self.published_measurements.load(Ordering::Relaxed)
    }

    pub fn downsampled_measurements(&self) -> u64 {
        self.downsampled_measurements.load(Ordering::Relaxed)
    }

    pub fn missed_sorts_by_timeout(&self) -> u64 {
        self.missed_sorts_by_timeout.load(Ordering::Relaxed)
    }

    pub fn wait_handle_expirations(&self) -> u64 {
        self.wait_handle_expirations.load(Ordering::Relaxed)
    }

    pub fn frames_ahead_of_schedule(&self) -> u64 {
        self.frames_ahead_of_schedule.load(Ordering::Relaxed)
    }

    pub fn published_frames(&self) -> u64 {
        self.published_frames.load(Ordering::Relaxed)
    }

    pub fn total_publish_time(&self) -> Duration {
        Duration::from_micros(self.total_publish_time_us.load(Ordering::Relaxed))
    }

    pub fn avg_publish_time_us(&self) -> u64 {
        let frames = self.published_frames();
        if frames == 0 {
            return 0;
        }
        self.total_publish_time_us.load(Ordering::Relaxed) / frames
    }

    pub fn reset(&self) {
        for counter in [
            &self.received_measurements,
            &self.processed_measurements,
            &self.discarded_measurements,
            &self.measurements_sorted_by_arrival,
            &self.published_measurements,
            &self.downsampled_measurements,
            &self.missed_sorts_by_timeout,
            &self.wait_handle_expirations,
            &self.frames_ahead_of_schedule,
            &self.published_frames,
            &self.total_publish_time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let received = self.received_measurements();
        let processed = self.processed_measurements();
        let frames = self.published_frames();

        MetricsSnapshot {
            received_measurements: received,
            processed_measurements: processed,
            discarded_measurements: self.discarded_measurements(),
            measurements_sorted_by_arrival: self.measurements_sorted_by_arrival(),
            published_measurements: self.published_measurements(),
            downsampled_measurements: self.downsampled_measurements(),
            missed_sorts_by_timeout: self.missed_sorts_by_timeout(),
            wait_handle_expirations: self.wait_handle_expirations(),
            frames_ahead_of_schedule: self.frames_ahead_of_schedule(),
            published_frames: frames,
            avg_publish_time_us: self.avg_publish_time_us(),
            pre_lag_publication: ratio(self.frames_ahead_of_schedule(), frames),
            downsampling_application: ratio(self.downsampled_measurements(), processed),
            published_measurement_loss: ratio(self.discarded_measurements(), processed),
            loss_due_to_timeouts: ratio(self.missed_sorts_by_timeout(), processed),
            measurement_time_accuracy: 1.0 - ratio(self.measurements_sorted_by_arrival(), received),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Point-in-time copy of the counters with derived ratios
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub received_measurements: u64,
    pub processed_measurements: u64,
    pub discarded_measurements: u64,
    pub measurements_sorted_by_arrival: u64,
    pub published_measurements: u64,
    pub downsampled_measurements: u64,
    pub missed_sorts_by_timeout: u64,
    pub wait_handle_expirations: u64,
    pub frames_ahead_of_schedule: u64,
    pub published_frames: u64,
    pub avg_publish_time_us: u64,
    pub pre_lag_publication: f64,
    pub downsampling_application: f64,
    pub published_measurement_loss: f64,
    pub loss_due_to_timeouts: f64,
    pub measurement_time_accuracy: f64,
}
