use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::distribution::frame_periods;

/// Identity of a shared timer: one OS timer exists per distinct key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerKey {
    pub frames_per_second: u32,
    /// -1 distributes periods over the frame rate, > 0 is a fixed period in milliseconds
    pub processing_interval: i32,
}

impl TimerKey {
    pub fn new(frames_per_second: u32, processing_interval: i32) -> Self {
        Self {
            frames_per_second: frames_per_second.min(1000),
            processing_interval,
        }
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.processing_interval > 0 {
            write!(f, "{}fps @ {}ms", self.frames_per_second, self.processing_interval)
        } else {
            write!(
                f,
                "{}fps @ {:.2}ms",
                self.frames_per_second,
                1000.0 / self.frames_per_second.max(1) as f64
            )
        }
    }
}

struct Subscriber {
    id: u64,
    waker: Sender<()>,
}

/// One OS timer thread fanning ticks out to every subscribed waker
pub struct FrameRateTimer {
    key: TimerKey,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    ticks: Arc<AtomicU64>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FrameRateTimer {
    pub fn start(key: TimerKey) -> Result<Self> {
        if key.processing_interval == 0 {
            bail!("A frame rate timer cannot be created for a processing interval of zero (process as fast as possible)");
        }
        if key.frames_per_second == 0 {
            bail!("A frame rate timer requires a frame rate greater than zero");
        }

        let periods = if key.processing_interval > 0 {
            vec![key.processing_interval as u32]
        } else {
            frame_periods(key.frames_per_second)
        };

        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let ticks = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let thread = {
            let subscribers = subscribers.clone();
            let ticks = ticks.clone();
            thread::Builder::new()
                .name(format!("frame-rate-timer-{}", key.frames_per_second))
                .spawn(move || run_timer(periods, subscribers, ticks, shutdown_rx))
                .with_context(|| format!("Failed to spawn frame rate timer thread for {}", key))?
        };

        debug!(timer = %key, "frame rate timer started");

        Ok(Self {
            key,
            subscribers,
            ticks,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn key(&self) -> TimerKey {
        self.key
    }

    pub fn subscribe(&self, id: u64, waker: Sender<()>) {
        self.subscribers.lock().push(Subscriber { id, waker });
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for FrameRateTimer {
    fn drop(&mut self) {
        // Closing the shutdown channel wakes the timer thread immediately
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(timer = %self.key, "frame rate timer disposed");
    }
}

fn run_timer(
    periods: Vec<u32>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    ticks: Arc<AtomicU64>,
    shutdown: Receiver<()>,
) {
    let mut index = 0;
    let mut period = periods[0];
    let mut wait = Duration::from_millis(period as u64);
    let mut deadline = Instant::now() + wait;

    loop {
        match shutdown.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        ticks.fetch_add(1, Ordering::Relaxed);

        for subscriber in subscribers.lock().iter() {
            // A full channel means the subscriber has not consumed the last tick yet
            let _ = subscriber.waker.try_send(());
        }

        index = (index + 1) % periods.len();
        let next = periods[index];
        if next != period {
            period = next;
            wait = Duration::from_millis(period as u64);
            trace!(period_ms = period, frame_index = index, "timer period changed");
        }

        deadline += wait;

        // After a long stall, restart the cadence instead of firing a burst of catch-up ticks
        let now = Instant::now();
        if deadline + wait < now {
            deadline = now + wait;
        }
    }
}
