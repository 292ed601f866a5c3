//! Millisecond-resolution pacing for synthetic or replayed input.
//!
//! Inputs that generate data (file replays, simulators) need to emit frames on the same
//! sub-second grid real devices would use. The timer runs a 1 ms loop aligned to the top of
//! the millisecond and pulses a wait handle each time the wall clock reaches the next frame
//! offset within the second.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::distribution::subsecond_distribution;
use super::WaitHandle;
use crate::core::Ticks;

/// Consecutive late windows tolerated before the timer resynchronizes
pub const MAX_MISSED_WINDOWS: u32 = 4;

pub type TimerErrorHandler = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

struct InputShared {
    handles: [Arc<WaitHandle>; 2],
    current: AtomicUsize,
    last_frame_time: AtomicI64,
    frames: AtomicU64,
    resynchronizations: AtomicU64,
    error_handlers: Mutex<Vec<(u64, TimerErrorHandler)>>,
}

impl InputShared {
    fn pulse(&self, frame_time: Ticks) {
        self.last_frame_time.store(frame_time.value(), Ordering::Release);
        self.frames.fetch_add(1, Ordering::Relaxed);

        // Waiters that fetch the handle after this point get the fresh, unsignaled one
        let signaled = self.current.load(Ordering::Acquire);
        let next = 1 - signaled;
        self.handles[next].reset();
        self.current.store(next, Ordering::Release);
        self.handles[signaled].set();
    }

    fn report(&self, error: anyhow::Error) {
        warn!(error = %error, "input timer error");
        for (_, handler) in self.error_handlers.lock().iter() {
            handler(&error);
        }
    }
}

/// Frame pacing timer for generated input at a fixed frame rate
pub struct InputTimer {
    frames_per_second: u32,
    shared: Arc<InputShared>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputTimer {
    pub fn start(frames_per_second: u32) -> Result<Self> {
        if frames_per_second == 0 || frames_per_second > 1000 {
            return Err(anyhow!(
                "Input timer frame rate must be between 1 and 1000, got {}",
                frames_per_second
            ));
        }

        let shared = Arc::new(InputShared {
            handles: [Arc::new(WaitHandle::new(false)), Arc::new(WaitHandle::new(false))],
            current: AtomicUsize::new(0),
            last_frame_time: AtomicI64::new(0),
            frames: AtomicU64::new(0),
            resynchronizations: AtomicU64::new(0),
            error_handlers: Mutex::new(Vec::new()),
        });

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("input-timer-{}", frames_per_second))
                .spawn(move || run_input_timer(frames_per_second, shared, shutdown_rx))
                .context("Failed to spawn input timer thread")?
        };

        debug!(frames_per_second, "input timer started");

        Ok(Self {
            frames_per_second,
            shared,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn frames_per_second(&self) -> u32 {
        self.frames_per_second
    }

    /// Handle that will be signaled at the next frame boundary
    pub fn frame_wait_handle(&self) -> Arc<WaitHandle> {
        self.shared.handles[self.shared.current.load(Ordering::Acquire)].clone()
    }

    /// Block until the next frame boundary or timeout; returns false on timeout
    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        self.frame_wait_handle().wait_timeout(timeout)
    }

    /// Aligned timestamp of the most recent frame boundary
    pub fn last_frame_time(&self) -> Ticks {
        Ticks(self.shared.last_frame_time.load(Ordering::Acquire))
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    pub fn resynchronizations(&self) -> u64 {
        self.shared.resynchronizations.load(Ordering::Relaxed)
    }

    pub(crate) fn add_error_handler(&self, id: u64, handler: TimerErrorHandler) {
        self.shared.error_handlers.lock().push((id, handler));
    }

    pub(crate) fn remove_error_handler(&self, id: u64) {
        self.shared.error_handlers.lock().retain(|(handler_id, _)| *handler_id != id);
    }
}

impl Drop for InputTimer {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        // Nobody may stay parked on a timer that no longer ticks
        for handle in &self.shared.handles {
            handle.set();
        }

        debug!(frames_per_second = self.frames_per_second, "input timer disposed");
    }
}

/// Millisecond-of-day position of the next frame to pulse
struct Schedule {
    targets: Vec<Ticks>,
    index: usize,
    second: Ticks,
}

impl Schedule {
    fn new(frames_per_second: u32) -> Self {
        Self {
            targets: subsecond_distribution(frames_per_second),
            index: 0,
            second: Ticks::ZERO,
        }
    }

    fn target(&self) -> Ticks {
        self.second + self.targets[self.index]
    }

    fn target_millis(&self) -> i64 {
        self.target().value().div_euclid(Ticks::PER_MILLISECOND)
    }

    fn advance(&mut self) {
        self.index += 1;
        if self.index == self.targets.len() {
            self.index = 0;
            self.second = self.second + Ticks(Ticks::PER_SECOND);
        }
    }

    /// Point at the first frame boundary strictly after `now`'s millisecond
    fn synchronize(&mut self, now: Ticks) {
        self.second = now.base_second();
        let now_millis = now.value().div_euclid(Ticks::PER_MILLISECOND);
        self.index = 0;

        while self.target_millis() <= now_millis {
            self.advance();
        }
    }
}

fn run_input_timer(frames_per_second: u32, shared: Arc<InputShared>, shutdown: Receiver<()>) {
    // Start on the top of a millisecond so the 1 ms cadence lines up with wall-clock milliseconds
    let now = Ticks::now();
    let into_millisecond = now.value().rem_euclid(Ticks::PER_MILLISECOND);
    let to_boundary = Duration::from_nanos(((Ticks::PER_MILLISECOND - into_millisecond) * 100) as u64);

    let mut deadline = Instant::now() + to_boundary;
    let mut schedule = Schedule::new(frames_per_second);
    schedule.synchronize(Ticks::now());

    let mut missed = 0u32;
    let tick = Duration::from_millis(1);

    loop {
        match shutdown.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        deadline += tick;
        if deadline < Instant::now() {
            deadline = Instant::now() + tick;
        }

        let now_millis = Ticks::now().value().div_euclid(Ticks::PER_MILLISECOND);
        let target_millis = schedule.target_millis();

        if now_millis < target_millis - 1000 {
            shared.report(anyhow!(
                "System clock moved backwards by {} ms, resynchronizing input timer",
                target_millis - now_millis
            ));
            schedule.synchronize(Ticks::now());
            shared.resynchronizations.fetch_add(1, Ordering::Relaxed);
            missed = 0;
            continue;
        }

        if now_millis < target_millis {
            continue;
        }

        if now_millis == target_millis {
            missed = 0;
        } else {
            missed += 1;
        }

        if missed > MAX_MISSED_WINDOWS {
            warn!(frames_per_second, missed, "input timer fell behind, resynchronizing");
            schedule.synchronize(Ticks::now());
            shared.resynchronizations.fetch_add(1, Ordering::Relaxed);
            missed = 0;
            continue;
        }

        shared.pulse(schedule.target());
        schedule.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_rates() {
        assert!(InputTimer::start(0).is_err());
        assert!(InputTimer::start(1001).is_err());
    }

    #[test]
    fn test_schedule_synchronizes_to_next_boundary() {
        let mut schedule = Schedule::new(10);
        let second = Ticks(1_000 * Ticks::PER_SECOND);

        schedule.synchronize(second + Ticks::from_millis(150));
        assert_eq!(schedule.target(), second + Ticks::from_millis(200));

        schedule.synchronize(second + Ticks::from_millis(950));
        assert_eq!(schedule.target(), second + Ticks(Ticks::PER_SECOND));
    }

    #[test]
    fn test_schedule_wraps_into_next_second() {
        let mut schedule = Schedule::new(2);
        let second = Ticks(50 * Ticks::PER_SECOND);

        schedule.synchronize(second + Ticks::from_millis(600));
        assert_eq!(schedule.target(), second + Ticks(Ticks::PER_SECOND));
        schedule.advance();
        assert_eq!(schedule.target(), second + Ticks(Ticks::PER_SECOND) + Ticks::from_millis(500));
    }

    #[test]
    fn test_pulses_frames_on_the_grid() {
        let timer = InputTimer::start(50).unwrap();

        for _ in 0..3 {
            assert!(timer.wait_for_frame(Duration::from_secs(1)));
        }

        let last = timer.last_frame_time();
        assert_eq!(last.distance_beyond_second() % (20 * Ticks::PER_MILLISECOND), 0);
        assert!(timer.frame_count() >= 3);
    }
}
