//! Measurement concentration: sorting inbound measurements into time-aligned frames and
//! publishing those frames in timestamp order once their lag time has elapsed.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::{
    ConcentratorConfig, ConcentratorState, ConfigError, FramePublisher, FrameQueue, FrameTemplate,
    LatestMeasurements, Settings,
};
use crate::core::{
    Clock, DownsamplingMethod, Frame, Measurement, MeasurementFilter, MergeOutcome, Ticks, WallClock,
};
use crate::observability::{ConcentratorEvents, ConcentratorMetrics, MetricsSnapshot, StatusReport, TracingEvents};
use crate::timing::{TimerRegistry, TimerSubscription};

/// Most recent measurement that could not be sorted, with its distance from real time
#[derive(Debug, Clone, PartialEq)]
pub struct DiscardedMeasurement {
    pub measurement: Measurement,
    pub latency: Ticks,
}

#[derive(Default)]
struct RunTimes {
    started: Option<Instant>,
    stopped: Option<Instant>,
}

/// State shared between the owning handle, sorting threads and the publication thread
struct Shared {
    settings: RwLock<Settings>,
    config: RwLock<ConcentratorConfig>,
    clock: Arc<dyn Clock>,
    queue: FrameQueue,
    metrics: ConcentratorMetrics,
    events: Arc<dyn ConcentratorEvents>,
    publisher: Mutex<Box<dyn FramePublisher>>,
    filter: Option<Arc<dyn MeasurementFilter>>,
    latest: LatestMeasurements,
    enabled: AtomicBool,
    real_time: AtomicI64,
    last_discarded: Mutex<Option<DiscardedMeasurement>>,
    state: RwLock<ConcentratorState>,
    run_times: Mutex<RunTimes>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

#[derive(Default)]
struct Runtime {
    worker: Option<JoinHandle<()>>,
    subscription: Option<TimerSubscription>,
}

/// Time-aligns measurements from many sources into frames and publishes them on a fixed cadence
///
/// Any number of threads may call [`sort_measurements`] while the concentrator is running.
/// A dedicated `concentrator-publisher` thread hands each frame to the [`FramePublisher`]
/// once the lag time has passed (or earlier, when preemptive publishing is enabled and the
/// frame is complete), woken by a shared frame rate timer from the [`TimerRegistry`].
///
/// [`sort_measurements`]: Concentrator::sort_measurements
pub struct Concentrator {
    shared: Arc<Shared>,
    registry: Arc<TimerRegistry>,
    runtime: Mutex<Runtime>,
    disposed: AtomicBool,
}

/// Optional collaborators for a [`Concentrator`]
pub struct ConcentratorBuilder {
    config: ConcentratorConfig,
    publisher: Box<dyn FramePublisher>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn ConcentratorEvents>>,
    timer_registry: Option<Arc<TimerRegistry>>,
    filter: Option<Arc<dyn MeasurementFilter>>,
}

impl ConcentratorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: Arc<dyn ConcentratorEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share timers with every other concentrator built against the same registry
    pub fn timer_registry(mut self, registry: Arc<TimerRegistry>) -> Self {
        self.timer_registry = Some(registry);
        self
    }

    /// Aggregation used by the filtered down-sampling method
    pub fn filter(mut self, filter: Arc<dyn MeasurementFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn build(self) -> Result<Concentrator> {
        let settings = self.config.validate()?;
        check_filter(&settings, &self.filter)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(WallClock));
        let queue = FrameQueue::new(
            clock.clone(),
            settings.alignment(),
            FrameTemplate::new(settings.downsampling_method, self.filter.clone()),
        );

        // Capacity one: a tick that lands while the worker is busy is coalesced
        let (wake_tx, wake_rx) = bounded(1);

        let shared = Arc::new(Shared {
            settings: RwLock::new(settings),
            config: RwLock::new(self.config),
            clock,
            queue,
            metrics: ConcentratorMetrics::new(),
            events: self.events.unwrap_or_else(|| Arc::new(TracingEvents)),
            publisher: Mutex::new(self.publisher),
            filter: self.filter,
            latest: LatestMeasurements::new(),
            enabled: AtomicBool::new(false),
            real_time: AtomicI64::new(0),
            last_discarded: Mutex::new(None),
            state: RwLock::new(ConcentratorState::Stopped),
            run_times: Mutex::new(RunTimes::default()),
            wake_tx,
            wake_rx,
        });

        Ok(Concentrator {
            shared,
            registry: self.timer_registry.unwrap_or_else(TimerRegistry::new),
            runtime: Mutex::new(Runtime::default()),
            disposed: AtomicBool::new(false),
        })
    }
}

fn check_filter(settings: &Settings, filter: &Option<Arc<dyn MeasurementFilter>>) -> Result<(), ConfigError> {
    if settings.downsampling_method == DownsamplingMethod::Filtered && filter.is_none() {
        return Err(ConfigError::FilterRequired);
    }
    Ok(())
}

impl Concentrator {
    pub fn builder(config: ConcentratorConfig, publisher: impl FramePublisher + 'static) -> ConcentratorBuilder {
        ConcentratorBuilder {
            config,
            publisher: Box::new(publisher),
            clock: None,
            events: None,
            timer_registry: None,
            filter: None,
        }
    }

    /// Begin concentration. Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if self.shared.enabled.load(Ordering::Acquire) {
            return Ok(());
        }

        self.ensure_transition(&ConcentratorState::Running { started_at: None })?;

        let shared = &self.shared;
        shared.metrics.reset();
        shared.queue.clear();
        shared.latest.clear();
        *shared.last_discarded.lock() = None;
        shared.real_time.store(0, Ordering::Release);
        while shared.wake_rx.try_recv().is_ok() {}

        let settings = *shared.settings.read();
        let subscription = match settings.timer_key() {
            Some(key) => Some(self.registry.attach(key, shared.wake_tx.clone())?),
            None => None,
        };

        shared.enabled.store(true, Ordering::Release);

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("concentrator-publisher".to_string())
                .spawn(move || run_publication(shared))
        };

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                shared.enabled.store(false, Ordering::Release);
                return Err(e).context("Failed to spawn concentrator publication thread");
            }
        };

        runtime.worker = Some(worker);
        runtime.subscription = subscription;

        let started = Instant::now();
        *shared.run_times.lock() = RunTimes {
            started: Some(started),
            stopped: None,
        };
        *shared.state.write() = ConcentratorState::Running {
            started_at: Some(started),
        };

        info!(
            frames_per_second = settings.frames_per_second,
            lag_time = settings.lag_time,
            lead_time = settings.lead_time,
            method = %settings.downsampling_method,
            "concentrator started"
        );
        Ok(())
    }

    /// Stop concentration, discarding queued frames. Does nothing if already stopped.
    pub fn stop(&self) {
        let mut runtime = self.runtime.lock();
        if !self.shared.enabled.swap(false, Ordering::AcqRel) {
            return;
        }

        let shared = &self.shared;
        shared.queue.clear();
        let _ = shared.wake_tx.try_send(());

        if let Some(worker) = runtime.worker.take() {
            if worker.join().is_err() {
                shared.notify(|events| events.process_exception(&anyhow!("Concentrator publication thread panicked")));
            }
        }

        // Dropping the subscription detaches from the shared timer
        runtime.subscription = None;
        shared.queue.clear();

        shared.run_times.lock().stopped = Some(Instant::now());
        *shared.state.write() = ConcentratorState::Stopped;

        info!(
            published_frames = shared.metrics.published_frames(),
            discarded = shared.metrics.discarded_measurements(),
            "concentrator stopped"
        );
    }

    fn ensure_transition(&self, target: &ConcentratorState) -> Result<()> {
        let state = self.shared.state.read();
        if !state.can_transition_to(target) {
            bail!("Invalid state transition: {} -> {}", state.name(), target.name());
        }
        Ok(())
    }

    /// Sort a batch of measurements into their frames
    ///
    /// Measurements that cannot be placed are counted, remembered as the last discarded
    /// measurement and reported once per batch through `discarding_measurements`.
    pub fn sort_measurements(&self, measurements: &[Measurement]) {
        self.shared.sort_measurements(measurements);
    }

    pub fn sort_measurement(&self, measurement: &Measurement) {
        self.shared.sort_measurements(std::slice::from_ref(measurement));
    }

    pub fn set_lag_time(&self, lag_time: f64) -> Result<()> {
        let mut config = self.config();
        config.lag_time = lag_time;
        self.reconfigure(config)
    }

    pub fn set_lead_time(&self, lead_time: f64) -> Result<()> {
        let mut config = self.config();
        config.lead_time = lead_time;
        self.reconfigure(config)
    }

    /// Apply a new configuration, moving to a different shared timer if the rate changed
    pub fn reconfigure(&self, config: ConcentratorConfig) -> Result<()> {
        let settings = config.validate()?;
        check_filter(&settings, &self.shared.filter)?;

        let mut runtime = self.runtime.lock();
        let shared = &self.shared;
        let previous = *shared.settings.read();
        let running = shared.enabled.load(Ordering::Acquire);

        let key_changed = previous.timer_key() != settings.timer_key();
        let subscription = match settings.timer_key() {
            Some(key) if running && key_changed => Some(self.registry.attach(key, shared.wake_tx.clone())?),
            _ => None,
        };

        shared.queue.set_alignment(settings.alignment());
        shared
            .queue
            .set_template(FrameTemplate::new(settings.downsampling_method, shared.filter.clone()));
        *shared.settings.write() = settings;
        *shared.config.write() = config;

        if running && key_changed {
            runtime.subscription = subscription;
            let _ = shared.wake_tx.try_send(());
        }

        debug!(
            frames_per_second = settings.frames_per_second,
            lag_time = settings.lag_time,
            lead_time = settings.lead_time,
            timer_changed = key_changed,
            "concentrator reconfigured"
        );
        Ok(())
    }

    pub fn config(&self) -> ConcentratorConfig {
        self.shared.config.read().clone()
    }

    pub fn settings(&self) -> Settings {
        *self.shared.settings.read()
    }

    pub fn state(&self) -> ConcentratorState {
        self.shared.state.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Best estimate of the current time
    pub fn real_time(&self) -> Ticks {
        let settings = *self.shared.settings.read();
        self.shared.real_time(&settings)
    }

    /// Seconds between `timestamp` and real time; positive values are in the past
    pub fn seconds_from_real_time(&self, timestamp: Ticks) -> f64 {
        let settings = *self.shared.settings.read();
        self.shared.seconds_from_real_time(&settings, timestamp)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn last_discarded_measurement(&self) -> Option<DiscardedMeasurement> {
        self.shared.last_discarded.lock().clone()
    }

    /// Newest value seen per key (populated when `track_latest_measurements` is set)
    pub fn latest_measurements(&self) -> &LatestMeasurements {
        &self.shared.latest
    }

    pub fn queued_frames(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn queue_state(&self) -> String {
        let expected = self.shared.settings.read().expected_measurements_per_frame;
        self.shared.queue.examine_queue_state(expected)
    }

    /// Time spent running, up to now or to the last stop
    pub fn run_time(&self) -> Duration {
        let times = self.shared.run_times.lock();
        match (times.started, times.stopped) {
            (Some(started), Some(stopped)) => stopped.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn timer_registry(&self) -> &Arc<TimerRegistry> {
        &self.registry
    }

    pub fn status_report(&self) -> StatusReport {
        let shared = &self.shared;
        let settings = *shared.settings.read();
        let last_discarded = self.last_discarded_measurement();
        let last_frame = shared.queue.last_published();
        let timer_key = settings.timer_key();

        let local_clock_deviation = (!settings.use_local_clock_as_real_time)
            .then(|| shared.seconds_from_real_time(&settings, shared.clock.now()));

        StatusReport {
            enabled: self.is_running(),
            run_time_seconds: self.run_time().as_secs_f64(),
            lag_time: settings.lag_time,
            lead_time: settings.lead_time,
            time_resolution: settings.time_resolution,
            downsampling_method: settings.downsampling_method,
            local_clock_time: shared.clock.now(),
            use_local_clock_as_real_time: settings.use_local_clock_as_real_time,
            local_clock_deviation,
            ignore_bad_timestamps: settings.ignore_bad_timestamps,
            allow_sorts_by_arrival: !settings.ignore_bad_timestamps && settings.allow_sorts_by_arrival,
            allow_preemptive_publishing: settings.allow_preemptive_publishing,
            perform_timestamp_reasonability_check: settings.perform_timestamp_reasonability_check,
            process_by_received_timestamp: settings.process_by_received_timestamp,
            expected_measurements_per_frame: settings.expected_measurements_per_frame,
            metrics: shared.metrics.snapshot(),
            last_discarded_latency: last_discarded.as_ref().map(|d| d.latency.to_seconds()),
            last_discarded_measurement: last_discarded.map(|d| d.measurement),
            use_precision_timer: settings.use_precision_timer,
            wait_handle_timeout_ms: settings.maximum_publication_timeout.as_millis() as u64,
            frames_per_second: settings.frames_per_second,
            ticks_per_frame: settings.ticks_per_frame,
            processing_interval: settings.processing_interval,
            timer_key,
            timer_reference_count: timer_key.map(|key| self.registry.reference_count(key)).unwrap_or(0),
            total_timers: self.registry.timer_count(),
            queued_frames: shared.queue.len(),
            last_published_frame: last_frame.as_ref().map(|frame| frame.timestamp()),
            last_sorted_measurement: last_frame.and_then(|frame| frame.last_sorted_measurement()),
        }
    }

    /// Multi-line status dump
    pub fn status(&self) -> String {
        self.status_report().render()
    }
}

impl Drop for Concentrator {
    fn drop(&mut self) {
        self.stop();

        if !self.disposed.swap(true, Ordering::AcqRel) {
            *self.shared.state.write() = ConcentratorState::Disposed;
            self.shared.notify(|events| events.disposed());
        }
    }
}

impl Shared {
    fn notify(&self, f: impl FnOnce(&dyn ConcentratorEvents)) {
        if panic::catch_unwind(AssertUnwindSafe(|| f(self.events.as_ref()))).is_err() {
            warn!("concentrator events sink panicked");
        }
    }

    fn real_time(&self, settings: &Settings) -> Ticks {
        let now = self.clock.now();
        if settings.use_local_clock_as_real_time {
            return now;
        }

        // An unset estimate starts at the local clock
        let _ = self
            .real_time
            .compare_exchange(0, now.value(), Ordering::AcqRel, Ordering::Acquire);

        if settings.perform_timestamp_reasonability_check {
            let estimate = Ticks(self.real_time.load(Ordering::Acquire));
            if !estimate.time_is_valid(now, settings.lead_time, settings.lead_time) {
                self.real_time.store(now.value(), Ordering::Release);
            }
        }

        Ticks(self.real_time.load(Ordering::Acquire))
    }

    fn seconds_from_real_time(&self, settings: &Settings, timestamp: Ticks) -> f64 {
        let initial = if settings.perform_timestamp_reasonability_check {
            self.clock.now()
        } else {
            timestamp
        };
        let _ = self
            .real_time
            .compare_exchange(0, initial.value(), Ordering::AcqRel, Ordering::Acquire);

        (self.real_time(settings) - timestamp).to_seconds()
    }

    /// Adopt `timestamp` as real time when it is newer and plausible
    fn update_real_time(&self, settings: &Settings, timestamp: Ticks) {
        if settings.use_local_clock_as_real_time {
            return;
        }

        let estimate = Ticks(self.real_time.load(Ordering::Acquire));
        if timestamp <= estimate {
            return;
        }

        if !settings.perform_timestamp_reasonability_check {
            self.real_time.fetch_max(timestamp.value(), Ordering::AcqRel);
            return;
        }

        let now = self.clock.now();
        if timestamp.time_is_valid(now, settings.lead_time, settings.lead_time) {
            self.real_time.fetch_max(timestamp.value(), Ordering::AcqRel);
        } else if !estimate.time_is_valid(now, settings.lead_time, settings.lead_time) {
            // neither the measurement nor the current estimate is believable
            self.real_time.store(now.value(), Ordering::Release);
        }
    }

    fn sort_measurements(&self, measurements: &[Measurement]) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }

        let settings = *self.settings.read();
        self.metrics.record_received(measurements.len() as u64);

        let mut discarded = Vec::new();
        // Batches from one source usually share a timestamp
        let mut cached: Option<(Ticks, Arc<Frame>)> = None;

        for measurement in measurements {
            let timestamp = if !settings.ignore_bad_timestamps && measurement.flags.is_bad_time() {
                if settings.allow_sorts_by_arrival {
                    self.metrics.record_sorted_by_arrival();
                    Some(self.real_time(&settings))
                } else {
                    None
                }
            } else {
                Some(measurement.timestamp)
            };

            let sorted = match timestamp {
                Some(timestamp) => self.sort_into_frame(&settings, measurement, timestamp, &mut cached),
                None => false,
            };

            match (sorted, timestamp) {
                (true, Some(timestamp)) => self.update_real_time(&settings, timestamp),
                _ => {
                    let latency = self.real_time(&settings) - measurement.timestamp;
                    *self.last_discarded.lock() = Some(DiscardedMeasurement {
                        measurement: measurement.clone(),
                        latency,
                    });
                    self.metrics.record_discarded();
                    discarded.push(measurement.clone());
                }
            }
        }

        if !discarded.is_empty() {
            trace!(count = discarded.len(), "measurements discarded");
            self.notify(|events| events.discarding_measurements(&discarded));
        }
    }

    fn sort_into_frame(
        &self,
        settings: &Settings,
        measurement: &Measurement,
        timestamp: Ticks,
        cached: &mut Option<(Ticks, Arc<Frame>)>,
    ) -> bool {
        let hit = cached
            .as_ref()
            .filter(|(last, _)| *last == timestamp)
            .map(|(_, frame)| frame.clone());

        let frame = match hit {
            Some(frame) => Some(frame),
            None => {
                let frame = if settings.process_by_received_timestamp {
                    self.queue.get_or_create_frame(timestamp)
                } else {
                    let distance = self.seconds_from_real_time(settings, timestamp);
                    let too_old = distance > settings.lag_time;
                    let too_new = settings.perform_timestamp_reasonability_check && distance < -settings.lead_time;

                    if too_old || too_new {
                        None
                    } else {
                        self.queue.get_or_create_frame(timestamp)
                    }
                };

                *cached = frame.clone().map(|frame| (timestamp, frame));
                frame
            }
        };

        let Some(frame) = frame else {
            return false;
        };

        match frame.merge(measurement) {
            MergeOutcome::Accepted { .. } => {
                self.metrics.record_processed();
                if settings.track_latest_measurements {
                    self.latest.update(measurement);
                }
                true
            }
            // Down-sampled away by the frame, neither processed nor discarded
            MergeOutcome::Superseded => {
                if settings.track_latest_measurements {
                    self.latest.update(measurement);
                }
                true
            }
            MergeOutcome::Published => {
                self.metrics.record_missed_sort();
                false
            }
        }
    }

    /// Publish every frame at the head of the queue that is due
    fn publish_ready_frames(&self) {
        while self.enabled.load(Ordering::Acquire) {
            let Some(frame) = self.queue.head() else {
                break;
            };

            let settings = *self.settings.read();
            let real_time = self.real_time(&settings);
            let timestamp = frame.timestamp();
            let mut ahead_of_schedule = false;

            if settings.process_by_received_timestamp {
                if settings.lag_ticks - (real_time - frame.created()).value() > 0 {
                    break;
                }
            } else if settings.lag_ticks - (real_time - timestamp).value() > 0 {
                let expected = settings.expected_measurements_per_frame;
                if expected < 1 || !settings.allow_preemptive_publishing || frame.sorted_count() < expected {
                    break;
                }
                ahead_of_schedule = true;
            }

            // The head may have changed since we looked at it
            if !self.queue.seal_head(&frame) {
                continue;
            }

            if ahead_of_schedule {
                self.metrics.record_frame_ahead_of_schedule();
            }

            let start = self.metrics.start_publication();
            let index = settings.frame_index(timestamp);

            let result = {
                let mut publisher = self.publisher.lock();
                panic::catch_unwind(AssertUnwindSafe(|| publisher.publish(&frame, index)))
            };

            self.queue.pop_if(&frame);
            self.metrics.finish_publication(
                start,
                frame.sorted_count() as u64,
                frame.downsampled_count(),
            );

            match result {
                Ok(Ok(())) => trace!(%timestamp, index, "frame published"),
                Ok(Err(e)) => {
                    let error = e.context(format!("Failed to publish frame {}", timestamp));
                    warn!(error = %format!("{:#}", error), "frame publication failed");
                    self.notify(|events| events.process_exception(&error));
                }
                Err(payload) => {
                    let error = anyhow!(
                        "Frame publisher panicked while publishing {}: {}",
                        timestamp,
                        panic_message(payload.as_ref())
                    );
                    warn!(error = %error, "frame publication panicked");
                    self.notify(|events| events.process_exception(&error));
                }
            }
        }
    }

    fn monitor_unpublished(&self, settings: &Settings) {
        let queued = self.queue.len() as i64;
        let seconds = (queued / settings.frames_per_second as i64 - 1).max(0) as usize;
        self.notify(|events| events.unpublished_samples(seconds));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_publication(shared: Arc<Shared>) {
    let mut next_monitor = Instant::now() + shared.settings.read().unpublished_monitor_interval;

    while shared.enabled.load(Ordering::Acquire) {
        shared.publish_ready_frames();

        let settings = *shared.settings.read();

        if Instant::now() >= next_monitor {
            shared.monitor_unpublished(&settings);
            next_monitor = Instant::now() + settings.unpublished_monitor_interval;
        }

        if !shared.enabled.load(Ordering::Acquire) {
            break;
        }

        if settings.use_precision_timer {
            match shared.wake_rx.recv_timeout(settings.maximum_publication_timeout) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => shared.metrics.record_wait_handle_expiration(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }

    debug!("concentrator publication thread exiting");
}
