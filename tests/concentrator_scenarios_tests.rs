use anyhow::{bail, Result};
use concentrator::core::{
    DownsamplingMethod, Frame, ManualClock, Measurement, MeasurementFlags, MeasurementKey, PublishedFrame, Ticks,
};
use concentrator::engine::{Concentrator, ConcentratorConfig};
use concentrator::observability::{ChannelEvents, ConcentratorEvent};
use crossbeam_channel::{unbounded, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const BASE: i64 = 1_700_000_000 * Ticks::PER_SECOND;
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn frame_time(index: i64) -> Ticks {
    Ticks(BASE + index * Ticks::PER_SECOND / 30)
}

fn channel_publisher() -> (
    impl FnMut(&Frame, usize) -> Result<()> + Send + 'static,
    Receiver<PublishedFrame>,
) {
    let (tx, rx) = unbounded();
    let publisher = move |frame: &Frame, index: usize| -> Result<()> {
        tx.send(frame.to_published(index))?;
        Ok(())
    };
    (publisher, rx)
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn next_exception(notifications: &Receiver<ConcentratorEvent>) -> Option<String> {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while let Ok(event) = notifications.recv_deadline(deadline) {
        if let ConcentratorEvent::ProcessException(message) = event {
            return Some(message);
        }
    }
    None
}

#[test]
fn test_in_order_feed_publishes_every_frame() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE + Ticks::from_millis(990).value())));
    let (publisher, frames) = channel_publisher();

    let concentrator = Concentrator::builder(ConcentratorConfig::new(30, 3.0, 1.0), publisher)
        .clock(clock.clone())
        .build()
        .unwrap();
    concentrator.start().unwrap();

    let key = MeasurementKey::new("PMU", 1);
    for i in 0..30 {
        concentrator.sort_measurement(&Measurement::new(key.clone(), frame_time(i), i as f64));
    }

    assert_eq!(concentrator.queued_frames(), 30);

    // Nothing is due until the lag time has passed
    assert!(frames.recv_timeout(Duration::from_millis(150)).is_err());

    clock.advance_seconds(3.5);

    for i in 0..30 {
        let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(frame.timestamp, frame_time(i));
        assert_eq!(frame.index, i as usize);
        assert_eq!(frame.measurements.len(), 1);
        assert_eq!(frame.get(&key).unwrap().value, i as f64);
    }

    assert!(wait_until(RECV_TIMEOUT, || concentrator.metrics().published_frames == 30));
    let metrics = concentrator.metrics();
    assert_eq!(metrics.received_measurements, 30);
    assert_eq!(metrics.processed_measurements, 30);
    assert_eq!(metrics.published_measurements, 30);
    assert_eq!(metrics.discarded_measurements, 0);
    assert_eq!(concentrator.queued_frames(), 0);

    concentrator.stop();
}

#[test]
fn test_closest_keeps_measurement_nearest_frame_time() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (publisher, frames) = channel_publisher();

    let config = ConcentratorConfig {
        downsampling_method: DownsamplingMethod::Closest,
        ..ConcentratorConfig::new(30, 3.0, 1.0)
    };
    let concentrator = Concentrator::builder(config, publisher)
        .clock(clock.clone())
        .build()
        .unwrap();
    concentrator.start().unwrap();

    let key = MeasurementKey::new("PMU", 1);
    let near = Measurement::new(key.clone(), Ticks(BASE + Ticks::from_millis(15).value()), 1.0);
    let far = Measurement::new(key.clone(), Ticks(BASE + Ticks::from_millis(20).value()), 2.0);

    concentrator.sort_measurements(&[near.clone(), far]);
    assert_eq!(concentrator.queued_frames(), 1);

    // The farther candidate is down-sampled away, not processed and not discarded
    let metrics = concentrator.metrics();
    assert_eq!(metrics.received_measurements, 2);
    assert_eq!(metrics.processed_measurements, 1);
    assert_eq!(metrics.discarded_measurements, 0);

    clock.advance_seconds(3.5);

    let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(frame.timestamp, Ticks(BASE));
    assert_eq!(frame.get(&key), Some(&near));
    assert_eq!(frame.downsampled, 1);

    assert!(wait_until(RECV_TIMEOUT, || concentrator.metrics().downsampled_measurements == 1));
    concentrator.stop();
}

#[test]
fn test_bad_timestamp_sorts_by_arrival() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (publisher, frames) = channel_publisher();

    let concentrator = Concentrator::builder(ConcentratorConfig::new(30, 3.0, 1.0), publisher)
        .clock(clock.clone())
        .build()
        .unwrap();
    concentrator.start().unwrap();

    let key = MeasurementKey::new("PMU", 7);
    let measurement = Measurement::new(key.clone(), Ticks(0), 42.0).with_flags(MeasurementFlags::BAD_TIME);
    concentrator.sort_measurement(&measurement);

    let metrics = concentrator.metrics();
    assert_eq!(metrics.measurements_sorted_by_arrival, 1);
    assert_eq!(metrics.processed_measurements, 1);
    assert_eq!(metrics.discarded_measurements, 0);
    assert_eq!(concentrator.queued_frames(), 1);

    clock.advance_seconds(3.5);

    // Placed at real time but the measurement keeps its own timestamp
    let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(frame.timestamp, Ticks(BASE));
    assert_eq!(frame.get(&key), Some(&measurement));

    concentrator.stop();
}

#[test]
fn test_stale_measurement_is_discarded() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (publisher, _frames) = channel_publisher();
    let (events, notifications) = ChannelEvents::channel();

    let concentrator = Concentrator::builder(ConcentratorConfig::new(30, 3.0, 1.0), publisher)
        .clock(clock.clone())
        .events(Arc::new(events))
        .build()
        .unwrap();
    concentrator.start().unwrap();

    let stale = Measurement::new(MeasurementKey::new("PMU", 1), Ticks(BASE - 10 * Ticks::PER_SECOND), 1.0);
    concentrator.sort_measurement(&stale);

    let metrics = concentrator.metrics();
    assert_eq!(metrics.received_measurements, 1);
    assert_eq!(metrics.discarded_measurements, 1);
    assert_eq!(metrics.processed_measurements, 0);
    assert_eq!(concentrator.queued_frames(), 0);

    let discarded = concentrator.last_discarded_measurement().unwrap();
    assert_eq!(discarded.measurement, stale);
    assert_eq!(discarded.latency, Ticks(10 * Ticks::PER_SECOND));

    let reported = notifications
        .try_iter()
        .find_map(|event| match event {
            ConcentratorEvent::DiscardingMeasurements(measurements) => Some(measurements),
            _ => None,
        })
        .unwrap();
    assert_eq!(reported, vec![stale]);

    assert!(concentrator.status().contains("Discarded measurements: 1"));
    concentrator.stop();
}

#[test]
fn test_zero_interval_publishes_by_creation_time() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (publisher, frames) = channel_publisher();

    let config = ConcentratorConfig {
        processing_interval: 0,
        ..ConcentratorConfig::new(30, 0.5, 1.0)
    };
    let concentrator = Concentrator::builder(config, publisher)
        .clock(clock.clone())
        .build()
        .unwrap();

    let settings = concentrator.settings();
    assert!(settings.process_by_received_timestamp);
    assert!(settings.use_local_clock_as_real_time);
    assert!(!settings.allow_sorts_by_arrival);
    assert!(!settings.use_precision_timer);

    concentrator.start().unwrap();
    assert_eq!(concentrator.timer_registry().timer_count(), 0);

    // Far older than the lag time, still accepted when ordering by arrival
    let key = MeasurementKey::new("PMU", 1);
    let old = Measurement::new(key.clone(), Ticks(BASE - 100 * Ticks::PER_SECOND), 5.0);
    concentrator.sort_measurement(&old);

    let bad_time = Measurement::new(key.clone(), Ticks(BASE), 6.0).with_flags(MeasurementFlags::BAD_TIME);
    concentrator.sort_measurement(&bad_time);

    let metrics = concentrator.metrics();
    assert_eq!(metrics.processed_measurements, 1);
    assert_eq!(metrics.discarded_measurements, 1);
    assert_eq!(metrics.measurements_sorted_by_arrival, 0);

    assert!(frames.recv_timeout(Duration::from_millis(150)).is_err());

    clock.advance_seconds(0.6);

    let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(frame.timestamp, Ticks(BASE - 100 * Ticks::PER_SECOND));
    assert_eq!(frame.get(&key), Some(&old));

    concentrator.stop();
}

#[test]
fn test_complete_frame_publishes_ahead_of_lag() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (publisher, frames) = channel_publisher();

    let config = ConcentratorConfig {
        expected_measurements_per_frame: 2,
        ..ConcentratorConfig::new(30, 3.0, 1.0)
    };
    let concentrator = Concentrator::builder(config, publisher)
        .clock(clock.clone())
        .build()
        .unwrap();
    concentrator.start().unwrap();

    concentrator.sort_measurement(&Measurement::new(MeasurementKey::new("PMU", 1), Ticks(BASE), 1.0));
    assert!(frames.recv_timeout(Duration::from_millis(150)).is_err());

    concentrator.sort_measurement(&Measurement::new(MeasurementKey::new("PMU", 2), Ticks(BASE), 2.0));

    let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(frame.measurements.len(), 2);
    assert!(wait_until(RECV_TIMEOUT, || concentrator.metrics().frames_ahead_of_schedule == 1));

    // Late arrival for an already published frame
    concentrator.sort_measurement(&Measurement::new(MeasurementKey::new("PMU", 3), Ticks(BASE), 3.0));
    let metrics = concentrator.metrics();
    assert_eq!(metrics.discarded_measurements, 1);

    concentrator.stop();
}

#[test]
fn test_publisher_error_does_not_stop_publication() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE + Ticks::PER_SECOND / 2)));
    let (events, notifications) = ChannelEvents::channel();
    let (tx, frames) = unbounded();

    let mut calls = 0;
    let publisher = move |frame: &Frame, index: usize| -> Result<()> {
        calls += 1;
        if calls == 1 {
            bail!("downstream rejected frame");
        }
        tx.send(frame.to_published(index))?;
        Ok(())
    };

    let concentrator = Concentrator::builder(ConcentratorConfig::new(30, 3.0, 1.0), publisher)
        .clock(clock.clone())
        .events(Arc::new(events))
        .build()
        .unwrap();
    concentrator.start().unwrap();

    let key = MeasurementKey::new("PMU", 1);
    concentrator.sort_measurements(&[
        Measurement::new(key.clone(), frame_time(0), 1.0),
        Measurement::new(key.clone(), frame_time(1), 2.0),
    ]);

    clock.advance_seconds(3.5);

    let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(frame.timestamp, frame_time(1));

    let error = next_exception(&notifications).unwrap();
    assert!(error.contains("downstream rejected frame"));

    // The failed frame still counts as published
    assert!(wait_until(RECV_TIMEOUT, || concentrator.metrics().published_frames == 2));
    concentrator.stop();
}

#[test]
fn test_publisher_panic_is_reported() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (events, notifications) = ChannelEvents::channel();

    let publisher = |_frame: &Frame, _index: usize| -> Result<()> { panic!("publisher exploded") };

    let concentrator = Concentrator::builder(ConcentratorConfig::new(30, 3.0, 1.0), publisher)
        .clock(clock.clone())
        .events(Arc::new(events))
        .build()
        .unwrap();
    concentrator.start().unwrap();

    concentrator.sort_measurement(&Measurement::new(MeasurementKey::new("PMU", 1), Ticks(BASE), 1.0));
    clock.advance_seconds(3.5);

    let error = next_exception(&notifications).unwrap();
    assert!(error.contains("publisher exploded"));
    assert!(concentrator.is_running());

    concentrator.stop();
}

#[test]
fn test_stop_clears_queue_and_drop_reports_disposal() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (publisher, _frames) = channel_publisher();
    let (events, notifications) = ChannelEvents::channel();

    let concentrator = Concentrator::builder(ConcentratorConfig::new(30, 3.0, 1.0), publisher)
        .clock(clock)
        .events(Arc::new(events))
        .build()
        .unwrap();
    concentrator.start().unwrap();

    concentrator.sort_measurement(&Measurement::new(MeasurementKey::new("PMU", 1), Ticks(BASE), 1.0));
    assert_eq!(concentrator.queued_frames(), 1);

    concentrator.stop();
    assert_eq!(concentrator.queued_frames(), 0);

    drop(concentrator);

    let disposals = notifications
        .try_iter()
        .filter(|event| *event == ConcentratorEvent::Disposed)
        .count();
    assert_eq!(disposals, 1);
}

#[test]
fn test_latest_measurements_tracking() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (publisher, _frames) = channel_publisher();

    let config = ConcentratorConfig {
        track_latest_measurements: true,
        ..ConcentratorConfig::new(30, 3.0, 1.0)
    };
    let concentrator = Concentrator::builder(config, publisher)
        .clock(clock)
        .build()
        .unwrap();
    concentrator.start().unwrap();

    let key = MeasurementKey::new("PMU", 1);
    concentrator.sort_measurements(&[
        Measurement::new(key.clone(), frame_time(1), 2.0),
        Measurement::new(key.clone(), frame_time(0), 1.0),
    ]);

    assert_eq!(concentrator.latest_measurements().get(&key).unwrap().value, 2.0);
    concentrator.stop();
}

#[test]
fn test_sort_into_frame_being_published_is_missed() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (entered_tx, entered) = unbounded();
    let (release, release_rx) = unbounded::<()>();
    let (tx, frames) = unbounded();

    let publisher = move |frame: &Frame, index: usize| -> Result<()> {
        entered_tx.send(())?;
        release_rx.recv()?;
        tx.send(frame.to_published(index))?;
        Ok(())
    };

    let config = ConcentratorConfig {
        expected_measurements_per_frame: 1,
        ..ConcentratorConfig::new(30, 3.0, 1.0)
    };
    let concentrator = Concentrator::builder(config, publisher)
        .clock(clock)
        .build()
        .unwrap();
    concentrator.start().unwrap();

    let first = MeasurementKey::new("PMU", 1);
    let late = MeasurementKey::new("PMU", 2);
    concentrator.sort_measurement(&Measurement::new(first.clone(), Ticks(BASE), 1.0));

    // Head frame is sealed and the publisher is holding it
    entered.recv_timeout(RECV_TIMEOUT).unwrap();
    concentrator.sort_measurement(&Measurement::new(late.clone(), Ticks(BASE), 2.0));

    let metrics = concentrator.metrics();
    assert_eq!(metrics.missed_sorts_by_timeout, 1);
    assert_eq!(metrics.discarded_measurements, 1);
    assert_eq!(metrics.processed_measurements, 1);

    release.send(()).unwrap();
    let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(frame.get(&first).is_some());
    assert!(frame.get(&late).is_none());

    concentrator.stop();
}

#[test]
fn test_wait_timeouts_are_counted_and_publication_continues() {
    let clock = Arc::new(ManualClock::new(Ticks(BASE)));
    let (publisher, frames) = channel_publisher();

    // One second timer period with a 5 ms wait forces repeated expirations
    let config = ConcentratorConfig {
        processing_interval: 1000,
        maximum_publication_timeout_ms: Some(5),
        ..ConcentratorConfig::new(30, 0.5, 1.0)
    };
    let concentrator = Concentrator::builder(config, publisher)
        .clock(clock.clone())
        .build()
        .unwrap();
    concentrator.start().unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(concentrator.metrics().wait_handle_expirations > 0);

    let key = MeasurementKey::new("PMU", 1);
    concentrator.sort_measurement(&Measurement::new(key.clone(), Ticks(BASE), 1.0));
    clock.advance_seconds(0.6);

    let frame = frames.recv_timeout(Duration::from_millis(500)).unwrap();
    assert_eq!(frame.get(&key).unwrap().value, 1.0);

    concentrator.stop();
}
