use std::sync::atomic::{AtomicI64, Ordering};

use super::Ticks;

/// Source of "now" for real-time estimation and frame creation times
pub trait Clock: Send + Sync {
    fn now(&self) -> Ticks;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> Ticks {
        Ticks::now()
    }
}

/// Settable clock for deterministic tests and replay
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Ticks) -> Self {
        Self {
            now: AtomicI64::new(start.value()),
        }
    }

    pub fn set(&self, now: Ticks) {
        self.now.store(now.value(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ticks) {
        self.now.fetch_add(by.value(), Ordering::SeqCst);
    }

    pub fn advance_seconds(&self, seconds: f64) {
        self.advance(Ticks::from_seconds(seconds));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ticks {
        Ticks(self.now.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(Ticks(1_000));
        clock.advance(Ticks(500));
        assert_eq!(clock.now(), Ticks(1_500));

        clock.advance_seconds(1.0);
        assert_eq!(clock.now(), Ticks(1_500 + Ticks::PER_SECOND));

        clock.set(Ticks(7));
        assert_eq!(clock.now(), Ticks(7));
    }

    #[test]
    fn test_wall_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        let floor = Ticks(1_577_836_800 * Ticks::PER_SECOND);
        assert!(WallClock.now() > floor);
    }
}
