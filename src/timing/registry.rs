use anyhow::Result;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{FrameRateTimer, InputTimer, TimerErrorHandler, TimerKey};

struct TimerEntry {
    timer: FrameRateTimer,
    references: usize,
}

struct InputEntry {
    timer: Arc<InputTimer>,
    references: usize,
}

#[derive(Default)]
struct Timers {
    frame_rate: HashMap<TimerKey, TimerEntry>,
    input: HashMap<u32, InputEntry>,
}

/// Reference-counted set of shared timers
///
/// Every concentrator attached with the same [`TimerKey`] shares one OS timer thread.
/// Timers are created on first attach and disposed when the last subscription drops.
/// Create one registry per process (or per test) and hand clones of the `Arc` to each
/// concentrator that should share timers.
#[derive(Default)]
pub struct TimerRegistry {
    timers: Mutex<Timers>,
    next_id: AtomicU64,
}

impl TimerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe `waker` to the timer for `key`, starting the timer if needed
    pub fn attach(self: &Arc<Self>, key: TimerKey, waker: Sender<()>) -> Result<TimerSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock();

        let entry = match timers.frame_rate.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => slot.insert(TimerEntry {
                timer: FrameRateTimer::start(key)?,
                references: 0,
            }),
        };

        entry.timer.subscribe(id, waker);
        entry.references += 1;
        debug!(timer = %key, references = entry.references, "attached to frame rate timer");

        Ok(TimerSubscription {
            registry: self.clone(),
            key,
            id,
        })
    }

    fn detach(&self, key: TimerKey, id: u64) {
        let disposed = {
            let mut timers = self.timers.lock();
            let Some(entry) = timers.frame_rate.get_mut(&key) else {
                return;
            };

            if entry.timer.unsubscribe(id) {
                entry.references = entry.references.saturating_sub(1);
            }
            debug!(timer = %key, references = entry.references, "detached from frame rate timer");

            if entry.references == 0 {
                timers.frame_rate.remove(&key)
            } else {
                None
            }
        };

        // Join the timer thread outside the registry lock
        drop(disposed);
    }

    /// Share (or start) the input pacing timer for `frames_per_second`
    pub fn attach_input(
        self: &Arc<Self>,
        frames_per_second: u32,
        on_error: Option<TimerErrorHandler>,
    ) -> Result<InputTimerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock();

        let timer = match timers.input.get_mut(&frames_per_second) {
            Some(entry) => {
                entry.references += 1;
                entry.timer.clone()
            }
            None => {
                let timer = Arc::new(InputTimer::start(frames_per_second)?);
                timers.input.insert(
                    frames_per_second,
                    InputEntry {
                        timer: timer.clone(),
                        references: 1,
                    },
                );
                timer
            }
        };

        if let Some(handler) = on_error {
            timer.add_error_handler(id, handler);
        }

        Ok(InputTimerHandle {
            registry: self.clone(),
            timer: Some(timer),
            id,
        })
    }

    fn detach_input(&self, frames_per_second: u32, id: u64) {
        let disposed = {
            let mut timers = self.timers.lock();
            let Some(entry) = timers.input.get_mut(&frames_per_second) else {
                return;
            };

            entry.timer.remove_error_handler(id);
            entry.references = entry.references.saturating_sub(1);

            if entry.references == 0 {
                timers.input.remove(&frames_per_second)
            } else {
                None
            }
        };

        drop(disposed);
    }

    pub fn reference_count(&self, key: TimerKey) -> usize {
        self.timers
            .lock()
            .frame_rate
            .get(&key)
            .map(|entry| entry.references)
            .unwrap_or(0)
    }

    pub fn input_reference_count(&self, frames_per_second: u32) -> usize {
        self.timers
            .lock()
            .input
            .get(&frames_per_second)
            .map(|entry| entry.references)
            .unwrap_or(0)
    }

    /// Number of live frame rate timers
    pub fn timer_count(&self) -> usize {
        self.timers.lock().frame_rate.len()
    }

    pub fn tick_count(&self, key: TimerKey) -> Option<u64> {
        self.timers
            .lock()
            .frame_rate
            .get(&key)
            .map(|entry| entry.timer.tick_count())
    }
}

/// Attachment to a shared frame rate timer; detaches exactly once when dropped
pub struct TimerSubscription {
    registry: Arc<TimerRegistry>,
    key: TimerKey,
    id: u64,
}

impl TimerSubscription {
    pub fn key(&self) -> TimerKey {
        self.key
    }

    pub fn registry(&self) -> &Arc<TimerRegistry> {
        &self.registry
    }
}

impl Drop for TimerSubscription {
    fn drop(&mut self) {
        self.registry.detach(self.key, self.id);
    }
}

/// Shared reference to an [`InputTimer`]; releases the reference when dropped
pub struct InputTimerHandle {
    registry: Arc<TimerRegistry>,
    timer: Option<Arc<InputTimer>>,
    id: u64,
}

impl Deref for InputTimerHandle {
    type Target = InputTimer;

    fn deref(&self) -> &InputTimer {
        self.timer
            .as_deref()
            .expect("InputTimerHandle accessed after drop")
    }
}

impl Drop for InputTimerHandle {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            let frames_per_second = timer.frames_per_second();
            // Release our Arc first so the registry holds the last one when disposing
            drop(timer);
            self.registry.detach_input(frames_per_second, self.id);
        }
    }
}
