//! Auto-reset wait event, the one OS blocking primitive this crate builds on.
//!
//! `set` wakes at most one waiter; a signal delivered while nobody is waiting
//! stays latched until the next `wait` consumes it. Monitor wake-up and
//! wait/pulse both rely on that stickiness to tolerate signal/timeout races.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            signaled: parking_lot::const_mutex(false),
            condvar: Condvar::new(),
        }
    }

    /// Signal the event, releasing one waiter (or latching if none).
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        drop(signaled);
        self.condvar.notify_one();
    }

    /// Drop any latched signal.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Block until signaled or until `timeout` elapses (`None` = forever).
    /// Returns `true` if the signal was consumed, `false` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = self.signaled.lock();
        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut signaled, deadline).timed_out() && !*signaled {
                        return false;
                    }
                }
                None => self.condvar.wait(&mut signaled),
            }
        }
        *signaled = false;
        true
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
