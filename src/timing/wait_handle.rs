use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Manual-reset event: stays signaled until explicitly reset
#[derive(Debug, Default)]
pub struct WaitHandle {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitHandle {
    pub fn new(initial: bool) -> Self {
        Self {
            signaled: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Returns false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();

        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }

        true
    }
}
