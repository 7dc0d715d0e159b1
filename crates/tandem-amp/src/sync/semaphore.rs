//! Counting semaphore with RTOS-style take/give semantics.
//!
//! `give` saturates at the configured maximum (a binary semaphore that is
//! already set stays set), and `take` supports a bounded or unbounded
//! wait. Envelope completion signals, the per-resource grant semaphores,
//! and the mailbox transmit gate are all instances of this.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{AmpError, Result};

/// Counting semaphore; see module docs.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
    max: u32,
}

impl Semaphore {
    /// Semaphore with an arbitrary maximum and initial count.
    #[must_use]
    pub fn new(max: u32, initial: u32) -> Self {
        Self {
            count: Mutex::new(initial.min(max)),
            cv: Condvar::new(),
            max,
        }
    }

    /// Binary semaphore, initially unavailable.
    #[must_use]
    pub fn binary() -> Self {
        Self::new(1, 0)
    }

    /// Binary semaphore, initially available.
    #[must_use]
    pub fn binary_available() -> Self {
        Self::new(1, 1)
    }

    /// Take one count, blocking until available.
    ///
    /// With `timeout == None` the wait is unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`AmpError::Timeout`] when a bounded wait elapses.
    pub fn take(&self, timeout: Option<Duration>) -> Result<()> {
        let mut count = self.count.lock().unwrap();
        match timeout {
            None => {
                while *count == 0 {
                    count = self.cv.wait(count).unwrap();
                }
            }
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while *count == 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(AmpError::timeout(limit));
                    }
                    let (guard, _) = self.cv.wait_timeout(count, deadline - now).unwrap();
                    count = guard;
                }
            }
        }
        *count -= 1;
        Ok(())
    }

    /// Take one count without blocking. Used to drain a stale signal.
    pub fn try_take(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Give one count, saturating at the maximum.
    pub fn give(&self) {
        let mut count = self.count.lock().unwrap();
        if *count < self.max {
            *count += 1;
        }
        drop(count);
        self.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn give_saturates_binary() {
        let sem = Semaphore::binary();
        sem.give();
        sem.give();
        sem.give();
        assert!(sem.try_take());
        assert!(!sem.try_take());
    }

    #[test]
    fn bounded_take_times_out() {
        let sem = Semaphore::binary();
        let err = sem.take(Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, AmpError::Timeout { .. }));
    }

    #[test]
    fn give_wakes_blocked_taker() {
        let sem = Arc::new(Semaphore::binary());
        let sem2 = Arc::clone(&sem);
        let waiter = thread::spawn(move || sem2.take(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        sem.give();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn drain_clears_stale_signal() {
        let sem = Semaphore::binary_available();
        assert!(sem.try_take());
        assert!(!sem.try_take());
    }
}
