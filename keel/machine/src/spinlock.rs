//! Spinlock that disables interrupts while held.
//!
//! On a uniprocessor a spinlock only has to keep the timer from preempting
//! the holder, so acquiring one disables interrupts. The lock word still
//! guards against host threads that are not the running kernel thread (for
//! instance a test harness thread inspecting the machine).
//!
//! A [`SpinLockGuard`] must be released with [`SpinLockGuard::unlock`].
//! Dropping it while held is a bug and panics, and so does switching threads
//! while any spinlock is held.

use crate::{cpu::with_cpu, interrupt::InterruptGuard};
use crossbeam_utils::Backoff;
use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// The lock could not be acquired without spinning.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual exclusion primitive protecting `T`.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning until it is available.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        let guard = loop {
            let guard = InterruptGuard::new();
            if !self.locked.swap(true, Ordering::Acquire) {
                break guard;
            }
            drop(guard);
            backoff.snooze();
        };
        SpinLockGuard::new(self, guard)
    }

    /// Tries to acquire the lock once.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = InterruptGuard::new();
        if !self.locked.swap(true, Ordering::Acquire) {
            Ok(SpinLockGuard::new(self, guard))
        } else {
            Err(WouldBlock)
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// A held [`SpinLock`].
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static std::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    guard: Option<InterruptGuard>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    #[track_caller]
    fn new(lock: &'a SpinLock<T>, guard: InterruptGuard) -> Self {
        with_cpu(|cpu| cpu.spinlock_acquired());
        Self {
            caller: std::panic::Location::caller(),
            lock,
            guard: Some(guard),
            _not_send: PhantomData,
        }
    }

    /// Releases the lock.
    pub fn unlock(mut self) {
        self.release();
        std::mem::forget(self);
    }

    fn release(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        with_cpu(|cpu| cpu.spinlock_released());
        self.guard.take();
    }
}

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
        // Unwinding through a held lock: release it so the panic surfaces
        // instead of a second one.
        self.release();
        if !std::thread::panicking() {
            panic!(
                "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
                self.caller
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(3);
        let mut guard = lock.lock();
        *guard += 1;
        assert!(lock.try_lock().is_err());
        guard.unlock();
        let guard = lock.try_lock().ok().unwrap();
        assert_eq!(*guard, 4);
        guard.unlock();
    }

    #[test]
    #[should_panic(expected = "must be explicitly called")]
    fn dropping_held_guard_panics() {
        let lock = SpinLock::new(());
        let _guard = lock.lock();
    }
}
