#![cfg_attr(not(test), no_std)]

//! Spin-based primitives for contexts that must not sleep.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// A simple spin lock for environments without blocking primitives.
pub struct SpinLock<T: ?Sized> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.flag.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Acquires the lock only if nobody holds it right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Counts accessors currently inside a shared object.
///
/// Every accessor brackets its work with [`BusyCounter::enter`]; the guard
/// leaves on drop. A teardown path publishes its intent (for example by
/// flipping a state word) and then calls [`BusyCounter::wait_idle`], which
/// spins until the count reaches zero. Entries use `SeqCst` so that either
/// the accessor sees the teardown flag or the teardown sees the entry.
#[derive(Debug, Default)]
pub struct BusyCounter {
    count: AtomicI32,
}

impl BusyCounter {
    pub const fn new() -> Self {
        Self { count: AtomicI32::new(0) }
    }

    pub fn enter(&self) -> BusyGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        BusyGuard { counter: self }
    }

    /// Current number of accessors.
    pub fn get(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Spins until no accessor is inside. Never sleeps.
    pub fn wait_idle(&self) {
        while self.count.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }

    fn leave(&self) {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "busy counter underflow");
    }
}

/// Scope of one accessor; leaves the counter on drop.
#[must_use = "dropping the guard immediately leaves the busy window"]
pub struct BusyGuard<'a> {
    counter: &'a BusyCounter,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.counter.leave();
    }
}
