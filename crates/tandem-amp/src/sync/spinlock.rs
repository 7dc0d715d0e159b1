//! Reentrant core-affine spinlock.
//!
//! The TM7 cores share SRAM through a pair of exclusive-access monitors;
//! the firmware's spinlock is a load-acquire/store-exclusive loop over an
//! owner word, with a nesting count so the owning core can re-acquire
//! freely. This port packs `{owner core, nesting count}` into one atomic
//! word updated by compare-and-swap.
//!
//! Acquisition always masks the local core's "interrupts" first. On the
//! host, a core is a set of threads and its interrupt mask is a reentrant
//! per-thread gate ([`InterruptMask`]); holding it serializes a core's
//! task threads against its mailbox delivery thread exactly as disabling
//! interrupts does on silicon. [`CoreToken`] bundles a core id with its
//! mask and is the "current core id provider" every acquire takes.
//!
//! Misuse — releasing from a core that does not own the lock, releasing
//! an unheld lock, or a corrupt nesting count — is a fatal assertion.
//! These conditions signal memory corruption or a logic bug; there is no
//! graceful recovery.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use tandem_chip::cpu::CoreId;

use crate::error::{AmpError, Result};

/// Owner-field sentinel: no core holds the lock.
const OWNER_FREE: u32 = u32::MAX;

fn pack(owner: u32, count: u32) -> u64 {
    (u64::from(count) << 32) | u64::from(owner)
}

fn unpack(state: u64) -> (u32, u32) {
    (state as u32, (state >> 32) as u32)
}

// ── Interrupt mask ───────────────────────────────────────────────────────────

/// Per-core reentrant gate standing in for local interrupt disable.
///
/// At most one thread of a core runs with "interrupts disabled" at a
/// time; re-entry by the same thread nests.
#[derive(Debug)]
pub struct InterruptMask {
    state: Mutex<MaskState>,
    cv: Condvar,
}

#[derive(Debug)]
struct MaskState {
    owner: Option<ThreadId>,
    depth: u32,
}

impl InterruptMask {
    fn new() -> Self {
        Self {
            state: Mutex::new(MaskState {
                owner: None,
                depth: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Mask interrupts for the returned guard's lifetime.
    pub fn disable(&self) -> MaskGuard<'_> {
        let me = thread::current().id();
        let mut s = self.state.lock().unwrap();
        loop {
            match s.owner {
                None => {
                    s.owner = Some(me);
                    s.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    s.depth += 1;
                    break;
                }
                Some(_) => s = self.cv.wait(s).unwrap(),
            }
        }
        MaskGuard {
            mask: self,
            _not_send: PhantomData,
        }
    }
}

/// Restores the interrupt mask on drop.
#[must_use = "interrupts are restored when the guard drops"]
pub struct MaskGuard<'a> {
    mask: &'a InterruptMask,
    _not_send: PhantomData<*const ()>,
}

impl Drop for MaskGuard<'_> {
    fn drop(&mut self) {
        let mut s = self.mask.state.lock().unwrap();
        s.depth -= 1;
        if s.depth == 0 {
            s.owner = None;
            drop(s);
            self.mask.cv.notify_one();
        }
    }
}

// ── Core token ───────────────────────────────────────────────────────────────

/// A core identity plus its interrupt mask.
///
/// One token exists per simulated core; every thread belonging to that
/// core holds a clone. All spinlock acquisitions name the acquiring core
/// through a token.
#[derive(Debug, Clone)]
pub struct CoreToken {
    core: CoreId,
    mask: Arc<InterruptMask>,
}

impl CoreToken {
    /// Create the token for one core.
    #[must_use]
    pub fn new(core: CoreId) -> Self {
        Self {
            core,
            mask: Arc::new(InterruptMask::new()),
        }
    }

    /// The core this token represents.
    #[must_use]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// The core's interrupt mask.
    #[must_use]
    pub fn mask(&self) -> &InterruptMask {
        &self.mask
    }
}

// ── Raw spinlock ─────────────────────────────────────────────────────────────

/// The bare lock word: `{owner core | free, nesting count}`.
///
/// Reentrant for the owning core. Use [`Spinlock`] instead when the lock
/// protects a piece of data.
#[derive(Debug)]
pub struct RawSpinlock {
    state: AtomicU64,
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpinlock {
    /// A free lock. Usable in statics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(pack_const(OWNER_FREE, 0)),
        }
    }

    /// Acquire, spinning until the owner word transitions free → us.
    /// Nested acquisition by the owning core increments the count.
    pub fn acquire<'a>(&'a self, token: &'a CoreToken) -> SpinGuard<'a> {
        let mask = token.mask.disable();
        self.lock_from(token.core, false);
        SpinGuard {
            lock: self,
            core: token.core,
            _mask: mask,
        }
    }

    /// Single acquisition attempt; `None` if another core holds the lock.
    pub fn try_acquire<'a>(&'a self, token: &'a CoreToken) -> Option<SpinGuard<'a>> {
        let mask = token.mask.disable();
        if !self.try_lock_from(token.core) {
            return None;
        }
        Some(SpinGuard {
            lock: self,
            core: token.core,
            _mask: mask,
        })
    }

    /// The core currently holding the lock, if any.
    #[must_use]
    pub fn holder(&self) -> Option<CoreId> {
        let (owner, _) = unpack(self.state.load(Ordering::Acquire));
        if owner == OWNER_FREE {
            None
        } else {
            CoreId::new(owner as u8)
        }
    }

    fn lock_from(&self, core: CoreId, exclusive: bool) {
        let me = u32::from(core.index());
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let (owner, count) = unpack(cur);
            if owner == me {
                assert!(
                    !exclusive,
                    "recursive acquisition of a data-bearing spinlock on {core}"
                );
                // Bad count value implies memory corruption.
                assert!(count > 0 && count < 0xFF, "spinlock count corrupt: {count}");
                // The interrupt mask serializes this core's contexts, so
                // no other thread of this core can race the increment.
                if self
                    .state
                    .compare_exchange(cur, pack(me, count + 1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            } else if owner == OWNER_FREE {
                if self
                    .state
                    .compare_exchange(
                        pack(OWNER_FREE, 0),
                        pack(me, 1),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return;
                }
                std::hint::spin_loop();
            } else {
                std::hint::spin_loop();
                thread::yield_now();
            }
        }
    }

    fn try_lock_from(&self, core: CoreId) -> bool {
        let me = u32::from(core.index());
        let cur = self.state.load(Ordering::Acquire);
        let (owner, count) = unpack(cur);
        if owner == me {
            assert!(count > 0 && count < 0xFF, "spinlock count corrupt: {count}");
            return self
                .state
                .compare_exchange(cur, pack(me, count + 1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        if owner != OWNER_FREE {
            return false;
        }
        self.state
            .compare_exchange(
                pack(OWNER_FREE, 0),
                pack(me, 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn unlock_from(&self, core: CoreId) {
        let cur = self.state.load(Ordering::Acquire);
        let (owner, count) = unpack(cur);
        // A mismatch here is a lock we didn't acquire, or corruption.
        assert!(
            owner == u32::from(core.index()),
            "spinlock released by {core} but owned by {owner:#x}"
        );
        assert!(count > 0 && count < 0x100, "spinlock count corrupt: {count}");
        let next = if count == 1 {
            pack(OWNER_FREE, 0)
        } else {
            pack(owner, count - 1)
        };
        // Release ordering publishes the critical section to the next owner.
        self.state.store(next, Ordering::Release);
    }
}

const fn pack_const(owner: u32, count: u32) -> u64 {
    ((count as u64) << 32) | (owner as u64)
}

/// Holds a [`RawSpinlock`]; releases (and restores interrupts) on drop.
#[must_use = "the lock is released when the guard drops"]
pub struct SpinGuard<'a> {
    lock: &'a RawSpinlock,
    core: CoreId,
    // Dropped after the unlock in `drop`, restoring interrupts last.
    _mask: MaskGuard<'a>,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_from(self.core);
    }
}

// ── Data-bearing spinlock ────────────────────────────────────────────────────

/// A spinlock protecting a value.
///
/// Unlike [`RawSpinlock`] this is deliberately *not* reentrant — handing
/// out two `&mut T` to the same core would alias — so nested acquisition
/// from the owning core is a fatal assertion rather than a count bump.
#[derive(Debug)]
pub struct Spinlock<T> {
    raw: RawSpinlock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `raw` (cross-core) and the
// interrupt mask (same-core contexts).
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Wrap a value.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinlock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire and borrow the protected value.
    pub fn lock<'a>(&'a self, token: &'a CoreToken) -> SpinlockGuard<'a, T> {
        let mask = token.mask.disable();
        self.raw.lock_from(token.core, true);
        SpinlockGuard {
            lock: self,
            core: token.core,
            _mask: mask,
        }
    }
}

/// Borrow of a [`Spinlock`]'s value; unlocks on drop.
#[must_use = "the lock is released when the guard drops"]
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    core: CoreId,
    _mask: MaskGuard<'a>,
}

impl<T> std::ops::Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the raw lock is held for the guard's lifetime.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the raw lock is held exclusively (non-reentrant path).
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_from(self.core);
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────────

/// Fixed-size pool of [`RawSpinlock`]s with a bitmap allocator.
///
/// The bitmap itself is guarded by a pool-level spinlock, so allocation
/// is safe from any core.
#[derive(Debug)]
pub struct SpinlockPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    locks: Box<[RawSpinlock]>,
    bitmap: Spinlock<Vec<u32>>,
}

/// A lock allocated from a [`SpinlockPool`]. Must be returned with
/// [`SpinlockPool::free`]; dropping the handle without freeing leaks the
/// pool slot until process exit.
#[derive(Debug)]
pub struct PooledLock {
    inner: Arc<PoolInner>,
    index: usize,
}

impl PooledLock {
    /// Index of the slot inside the pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Acquire the pooled lock. The guard is independent of this handle,
    /// so a free attempt while the guard lives is rejected at runtime
    /// rather than by the borrow checker.
    pub fn acquire<'t>(&self, token: &'t CoreToken) -> PoolGuard<'t> {
        let mask = token.mask.disable();
        self.inner.locks[self.index].lock_from(token.core, false);
        PoolGuard {
            inner: Arc::clone(&self.inner),
            index: self.index,
            core: token.core,
            _mask: mask,
        }
    }

    /// The core currently holding this pooled lock, if any.
    #[must_use]
    pub fn holder(&self) -> Option<CoreId> {
        self.inner.locks[self.index].holder()
    }
}

/// Holds a pooled lock; releases on drop.
#[must_use = "the lock is released when the guard drops"]
pub struct PoolGuard<'t> {
    inner: Arc<PoolInner>,
    index: usize,
    core: CoreId,
    _mask: MaskGuard<'t>,
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.inner.locks[self.index].unlock_from(self.core);
    }
}

impl SpinlockPool {
    /// Create a pool of `capacity` locks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(32);
        let mut bitmap = vec![0u32; words];
        // Mark the bits past `capacity` as allocated so the scan never
        // hands them out.
        let tail = capacity % 32;
        if tail != 0 {
            bitmap[words - 1] = !0u32 << tail;
        }
        Self {
            inner: Arc::new(PoolInner {
                locks: (0..capacity).map(|_| RawSpinlock::new()).collect(),
                bitmap: Spinlock::new(bitmap),
            }),
        }
    }

    /// Allocate a free lock.
    ///
    /// # Errors
    ///
    /// Returns [`AmpError::PoolExhausted`] when every slot is in use —
    /// usually a sign some caller forgot to free.
    pub fn alloc(&self, token: &CoreToken) -> Result<PooledLock> {
        let mut bitmap = self.inner.bitmap.lock(token);
        for (w, word) in bitmap.iter_mut().enumerate() {
            if *word != !0u32 {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Ok(PooledLock {
                    inner: Arc::clone(&self.inner),
                    index: w * 32 + bit,
                });
            }
        }
        tracing::debug!("spinlock pool exhausted ({} slots)", self.inner.locks.len());
        Err(AmpError::PoolExhausted)
    }

    /// Return a lock to the pool.
    ///
    /// # Errors
    ///
    /// Rejected with [`AmpError::LockHeld`] if the lock is still held, or
    /// if the handle belongs to a different pool; the handle is returned
    /// so the caller can retry after the holder releases.
    pub fn free(
        &self,
        token: &CoreToken,
        lock: PooledLock,
    ) -> std::result::Result<(), (PooledLock, AmpError)> {
        if !Arc::ptr_eq(&self.inner, &lock.inner) {
            return Err((
                lock,
                AmpError::NotInitialized {
                    what: "lock belongs to a different pool",
                },
            ));
        }
        if let Some(owner) = self.inner.locks[lock.index].holder() {
            let owner = owner.index();
            return Err((lock, AmpError::LockHeld { owner }));
        }
        let mut bitmap = self.inner.bitmap.lock(token);
        bitmap[lock.index / 32] &= !(1 << (lock.index % 32));
        Ok(())
    }

    /// Number of slots currently allocated.
    #[must_use]
    pub fn allocated(&self, token: &CoreToken) -> usize {
        let bitmap = self.inner.bitmap.lock(token);
        let used: u32 = bitmap.iter().map(|w| w.count_ones()).sum();
        let tail = self.inner.locks.len() % 32;
        let reserved = if tail == 0 { 0 } else { 32 - tail };
        used as usize - reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;

    #[test]
    fn reentrant_on_owning_core() {
        let token = CoreToken::new(CoreId::CPU0);
        let lock = RawSpinlock::new();
        let g1 = lock.acquire(&token);
        let g2 = lock.acquire(&token);
        let g3 = lock.acquire(&token);
        assert_eq!(lock.holder(), Some(CoreId::CPU0));
        drop(g3);
        drop(g2);
        assert_eq!(lock.holder(), Some(CoreId::CPU0));
        drop(g1);
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn two_cores_never_hold_simultaneously() {
        let lock = Arc::new(Spinlock::new(0u64));
        let in_section = Arc::new(AtomicBool::new(false));
        let iters = 10_000u64;

        let mut handles = Vec::new();
        for core in [CoreId::CPU0, CoreId::CPU1] {
            let lock = Arc::clone(&lock);
            let in_section = Arc::clone(&in_section);
            handles.push(thread::spawn(move || {
                let token = CoreToken::new(core);
                for _ in 0..iters {
                    let mut g = lock.lock(&token);
                    assert!(
                        !in_section.swap(true, Ordering::SeqCst),
                        "two holders inside the critical section"
                    );
                    *g += 1;
                    in_section.store(false, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let token = CoreToken::new(CoreId::CPU0);
        assert_eq!(*lock.lock(&token), 2 * iters);
    }

    #[test]
    fn mask_serializes_same_core_threads() {
        // Two threads of the same core: the interrupt mask alone must
        // exclude them, since the lock word would admit both.
        let token = CoreToken::new(CoreId::CPU0);
        let lock = Arc::new(RawSpinlock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let token = token.clone();
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.acquire(&token);
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(1));
                    assert_eq!(counter.load(Ordering::SeqCst), seen + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn try_acquire_fails_while_peer_holds() {
        let lock = Arc::new(RawSpinlock::new());
        let t0 = CoreToken::new(CoreId::CPU0);
        let g = lock.acquire(&t0);

        let lock2 = Arc::clone(&lock);
        let peer = thread::spawn(move || {
            let t1 = CoreToken::new(CoreId::CPU1);
            let r = lock2.try_acquire(&t1).is_none();
            r
        });
        assert!(peer.join().unwrap());
        drop(g);

        let lock3 = Arc::clone(&lock);
        let peer = thread::spawn(move || {
            let t1 = CoreToken::new(CoreId::CPU1);
            let r = lock3.try_acquire(&t1).is_some();
            r
        });
        assert!(peer.join().unwrap());
    }

    #[test]
    #[should_panic(expected = "recursive acquisition")]
    fn data_lock_rejects_recursion() {
        let token = CoreToken::new(CoreId::CPU0);
        let lock = Spinlock::new(());
        let _g1 = lock.lock(&token);
        let _g2 = lock.lock(&token);
    }

    #[test]
    fn pool_alloc_free_cycle() {
        let token = CoreToken::new(CoreId::CPU0);
        let pool = SpinlockPool::new(3);
        let a = pool.alloc(&token).unwrap();
        let b = pool.alloc(&token).unwrap();
        let c = pool.alloc(&token).unwrap();
        assert_eq!(pool.allocated(&token), 3);
        assert!(matches!(pool.alloc(&token), Err(AmpError::PoolExhausted)));

        pool.free(&token, b).unwrap();
        assert_eq!(pool.allocated(&token), 2);
        let b2 = pool.alloc(&token).unwrap();
        assert_eq!(b2.index(), 1);

        pool.free(&token, a).unwrap();
        pool.free(&token, b2).unwrap();
        pool.free(&token, c).unwrap();
        assert_eq!(pool.allocated(&token), 0);
    }

    #[test]
    fn pool_rejects_freeing_held_lock() {
        let token = CoreToken::new(CoreId::CPU0);
        let pool = SpinlockPool::new(1);
        let lock = pool.alloc(&token).unwrap();

        let guard = lock.acquire(&token);
        let lock = match pool.free(&token, lock) {
            Err((returned, AmpError::LockHeld { owner })) => {
                assert_eq!(owner, 0);
                returned
            }
            other => panic!("expected LockHeld, got {other:?}"),
        };
        drop(guard);

        pool.free(&token, lock).map_err(|(_, e)| e).unwrap();
        assert_eq!(pool.allocated(&token), 0);
    }
}
