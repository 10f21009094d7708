//! Spinlocks for multiprocessor mutual exclusion.
//!
//! Every logical processor in this system is an independent hardware thread,
//! so protecting shared state requires an atomic test-and-set loop rather
//! than mere preemption control. Two surfaces are exported:
//!
//! - [`SpinLock`], an RAII-guarded lock owning its data. This is the default
//!   for any shared structure.
//! - [`RawSpinLock`], a bare acquire/release pair with no guard. It exists
//!   for the one place an RAII guard cannot express: a lock that must be
//!   released and reacquired across a control transfer the borrow checker
//!   cannot see (the guest entry/exit boundary).

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Error returned by [`SpinLock::try_lock`] when the lock is already held.
#[derive(Debug)]
pub enum TryLockError {
    /// The lock could not be acquired at this time because the operation
    /// would otherwise block.
    WouldBlock,
}

/// A mutual exclusion primitive protecting the data it owns.
///
/// The data can only be reached through the RAII guard returned from
/// [`lock`] and [`try_lock`], so it is only ever accessed while the lock is
/// held.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning until it is available.
    ///
    /// Relocking from the thread that already holds the lock deadlocks.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self.locked.fetch_or(true, Ordering::SeqCst) {
            while self.locked.load(Ordering::SeqCst) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, TryLockError> {
        if self.locked.fetch_or(true, Ordering::SeqCst) {
            Err(TryLockError::WouldBlock)
        } else {
            Ok(SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        }
    }
}

/// An RAII implementation of a "scoped lock" of a spinlock.
///
/// When this structure is dropped (falls out of scope), the lock will be
/// unlocked.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    // A guard must be released on the processor that took it.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::SeqCst);
    }
}

/// A guardless lock: explicit [`acquire`]/[`release`] with nothing owned.
///
/// The holder is responsible for pairing every acquire with a release. The
/// guest run loop uses one of these as the coarse host lock it must drop
/// immediately before handing the processor to guest code and retake
/// immediately after the VM-exit returns.
///
/// [`acquire`]: Self::acquire
/// [`release`]: Self::release
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Creates a new unheld lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is taken.
    pub fn acquire(&self) {
        while self.locked.fetch_or(true, Ordering::SeqCst) {
            while self.locked.load(Ordering::SeqCst) {
                core::hint::spin_loop();
            }
        }
    }

    /// Releases the lock.
    ///
    /// # Safety
    /// The caller must currently hold the lock.
    pub unsafe fn release(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_held(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counter_is_exact_under_contention() {
        let data = Arc::new(SpinLock::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let data = Arc::clone(&data);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *data.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*data.lock(), 8000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(matches!(lock.try_lock(), Err(TryLockError::WouldBlock)));
        drop(guard);
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn raw_lock_acquire_release() {
        let raw = RawSpinLock::new();
        assert!(!raw.is_held());
        raw.acquire();
        assert!(raw.is_held());
        unsafe { raw.release() };
        assert!(!raw.is_held());
    }
}
