//! Core-local synchronization primitives.
//!
//! Everything above this module — IPC lists, resource-lock count tables,
//! the spinlock pool — builds on these three primitives:
//!
//! | Primitive | Stands in for |
//! |-----------|---------------|
//! | [`spinlock`] | Inter-core exclusive-monitor spinlock + local interrupt masking |
//! | [`semaphore`] | RTOS binary semaphore (take with timeout / give / drain) |
//! | [`event`] | RTOS event group (post bits / wait-any with clear) |
//!
//! The host port models each simulated core as a set of threads. A core's
//! *mailbox delivery thread* plays the role of its interrupt context;
//! [`in_isr_context`] reports whether the calling thread is currently
//! inside a delivery callback, so blocking APIs can reject such callers
//! the way the firmware rejects calls from ISRs.

pub mod event;
pub mod semaphore;
pub mod spinlock;

use std::cell::Cell;

thread_local! {
    static NON_PREEMPTIBLE: Cell<u32> = const { Cell::new(0) };
}

/// True if the calling thread is inside a mailbox delivery callback
/// (the host stand-in for interrupt context).
#[must_use]
pub fn in_isr_context() -> bool {
    NON_PREEMPTIBLE.with(|c| c.get() > 0)
}

/// Marks the current thread as non-preemptible for the scope's lifetime.
/// Entered by the IPC core around transport delivery callbacks.
pub(crate) struct IsrScope(());

impl IsrScope {
    pub(crate) fn enter() -> Self {
        NON_PREEMPTIBLE.with(|c| c.set(c.get() + 1));
        Self(())
    }
}

impl Drop for IsrScope {
    fn drop(&mut self) {
        NON_PREEMPTIBLE.with(|c| c.set(c.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isr_scope_nests() {
        assert!(!in_isr_context());
        {
            let _a = IsrScope::enter();
            assert!(in_isr_context());
            {
                let _b = IsrScope::enter();
                assert!(in_isr_context());
            }
            assert!(in_isr_context());
        }
        assert!(!in_isr_context());
    }
}
