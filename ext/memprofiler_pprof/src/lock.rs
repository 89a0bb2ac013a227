use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr;

use lock_api::RawReentrantMutex;
use parking_lot::{RawMutex, RawThreadId};

type RawLock = RawReentrantMutex<RawMutex, RawThreadId>;

/// Reentrant lock guarding a collector's state.
///
/// It has to be reentrant: capturing a backtrace while holding the lock can
/// allocate, which fires the allocation hook again on the same thread.
///
/// Unlike `parking_lot::ReentrantMutex`, the raw lock can be locked and
/// unlocked without a guard and re-created in place, which the fork handlers
/// need (see `fork.rs`).
pub struct CollectorLock {
    raw: UnsafeCell<RawLock>,
}

// The raw lock is only ever replaced in a freshly forked child, where the
// calling thread is the only one left.
unsafe impl Send for CollectorLock {}
unsafe impl Sync for CollectorLock {}

impl CollectorLock {
    pub const fn new() -> Self {
        Self {
            raw: UnsafeCell::new(RawLock::INIT),
        }
    }

    fn raw(&self) -> &RawLock {
        unsafe { &*self.raw.get() }
    }

    pub fn lock(&self) -> CollectorLockGuard<'_> {
        self.raw().lock();
        CollectorLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<CollectorLockGuard<'_>> {
        if self.raw().try_lock() {
            Some(CollectorLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw().is_locked()
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.raw().is_owned_by_current_thread()
    }

    /// Acquires the lock with no guard. Paired with
    /// [`CollectorLock::unlock_after_fork`] or [`CollectorLock::reinitialize`].
    pub(crate) fn lock_for_fork(&self) {
        self.raw().lock();
    }

    /// # Safety
    /// The current thread must hold the lock through `lock_for_fork`.
    pub(crate) unsafe fn unlock_after_fork(&self) {
        unsafe { self.raw().unlock() }
    }

    /// Replaces the lock with a fresh, unlocked one.
    ///
    /// # Safety
    /// No other thread may be using the lock. Only sound in a forked child
    /// (single-threaded) after `lock_for_fork` was called in the parent.
    pub(crate) unsafe fn reinitialize(&self) {
        unsafe { ptr::write(self.raw.get(), RawLock::INIT) }
    }
}

impl Default for CollectorLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CollectorLockGuard<'a> {
    lock: &'a CollectorLock,
    // Must be released on the thread that acquired it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for CollectorLockGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.lock.raw().unlock() }
    }
}
