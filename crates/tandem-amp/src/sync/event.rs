//! Event set: post bits from any context, wait for any of a mask.
//!
//! The IPC dispatcher and the liveness supervisor each block on one of
//! these. A successful wait *claims* (clears) the matched bits, so each
//! posted event is observed exactly once.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A 32-bit event set.
#[derive(Debug, Default)]
pub struct EventSet {
    bits: Mutex<u32>,
    cv: Condvar,
}

impl EventSet {
    /// Empty event set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Post events. Wakes all waiters whose mask intersects.
    pub fn post(&self, bits: u32) {
        let mut cur = self.bits.lock().unwrap();
        *cur |= bits;
        drop(cur);
        self.cv.notify_all();
    }

    /// Wait until any bit of `mask` is posted, claim and return the
    /// matched bits. Returns `0` if a bounded wait elapses first.
    ///
    /// With `timeout == None` the wait is unbounded.
    pub fn wait_any(&self, mask: u32, timeout: Option<Duration>) -> u32 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut bits = self.bits.lock().unwrap();
        loop {
            let matched = *bits & mask;
            if matched != 0 {
                *bits &= !matched;
                return matched;
            }
            match deadline {
                None => bits = self.cv.wait(bits).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    let (guard, _) = self.cv.wait_timeout(bits, deadline - now).unwrap();
                    bits = guard;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const A: u32 = 1 << 0;
    const B: u32 = 1 << 1;

    #[test]
    fn claim_clears_only_matched() {
        let ev = EventSet::new();
        ev.post(A | B);
        assert_eq!(ev.wait_any(A, Some(Duration::ZERO)), A);
        // B is still pending.
        assert_eq!(ev.wait_any(A | B, Some(Duration::ZERO)), B);
        assert_eq!(ev.wait_any(A | B, Some(Duration::from_millis(5))), 0);
    }

    #[test]
    fn post_wakes_waiter() {
        let ev = Arc::new(EventSet::new());
        let ev2 = Arc::clone(&ev);
        let waiter = thread::spawn(move || ev2.wait_any(B, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        ev.post(B);
        assert_eq!(waiter.join().unwrap(), B);
    }

    #[test]
    fn timeout_returns_zero() {
        let ev = EventSet::new();
        assert_eq!(ev.wait_any(A, Some(Duration::from_millis(10))), 0);
    }
}
