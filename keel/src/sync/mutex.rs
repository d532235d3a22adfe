//! Mutex with priority donation.
//!
//! A [`Mutex`] puts threads that cannot acquire it to sleep. While a thread
//! sleeps on a mutex, it donates its effective priority to the holder, so a
//! low-priority holder cannot be starved by medium-priority threads while a
//! high-priority thread waits for it. The donation follows chains of nested
//! locks (see [`crate::thread`]) and is withdrawn when the lock is released.
//! Donation is disabled under MLFQS.
//!
//! On release, the lock is handed directly to the waiter with the highest
//! effective priority. Like [`SpinLock`], the guard must be released with an
//! explicit [`MutexGuard::unlock`]; dropping a held guard panics.
//!
//! [`SpinLock`]: super::SpinLock

use super::{SpinLock, WouldBlock, take_highest};
use crate::{
    kernel,
    thread::{self, Current, ParkHandle, Tid},
};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};
use keel_machine::interrupt::InterruptGuard;

struct State {
    holder: Option<Tid>,
    waiters: Vec<ParkHandle>,
}

/// Sleeping lock around a value of type `T`.
///
/// A thread that finds the mutex taken sleeps until the holder hands it
/// over. The value is reachable only through the guard returned by [`lock`]
/// or [`try_lock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct Mutex<T> {
    state: SpinLock<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex holding `t`.
    #[inline]
    pub const fn new(t: T) -> Mutex<T> {
        Mutex {
            state: SpinLock::new(State {
                holder: None,
                waiters: Vec::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    /// A held mutex never moves, so its address identifies it.
    fn id(&self) -> usize {
        self as *const _ as usize
    }

    /// Takes the mutex, sleeping while another thread holds it.
    ///
    /// # Panics
    /// Locking a mutex in the thread which already holds the lock panics.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let kernel = kernel();
        let _guard = InterruptGuard::new();
        let me = Current::get_tid();
        let mut state = self.state.lock();
        match state.holder {
            None => {
                state.holder = Some(me);
                state.unlock();
                let mut table = kernel.threads.lock();
                table.lock_holders.insert(self.id(), me);
                table.unlock();
            }
            Some(holder) if holder == me => {
                state.unlock();
                panic!("Recursive acquisition of a mutex by thread {me}.");
            }
            Some(holder) => {
                log::trace!("thread {me} sleeps on a mutex held by {holder}");
                Current::park_with(|handle| {
                    state.waiters.push(handle);
                    state.unlock();
                    let mut table = kernel.threads.lock();
                    table.current().lock_waiting = Some(self.id());
                    table.refresh_priority(holder);
                    table.unlock();
                });
                // The releasing thread handed the lock over.
            }
        }
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Takes the mutex if it is free, without sleeping.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        let kernel = kernel();
        let _guard = InterruptGuard::new();
        let me = Current::get_tid();
        let mut state = self.state.lock();
        if state.holder.is_some() {
            state.unlock();
            return Err(WouldBlock);
        }
        state.holder = Some(me);
        state.unlock();
        let mut table = kernel.threads.lock();
        table.lock_holders.insert(self.id(), me);
        table.unlock();
        Ok(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Thread that holds the mutex, if any.
    pub fn holder(&self) -> Option<Tid> {
        let state = self.state.lock();
        let holder = state.holder;
        state.unlock();
        holder
    }

    /// Unwraps the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn release(&self) {
        let kernel = kernel();
        let _guard = InterruptGuard::new();
        let me = Current::get_tid();
        let mut state = self.state.lock();
        assert_eq!(
            state.holder,
            Some(me),
            "Releasing a mutex that the thread does not hold."
        );
        let mut table = kernel.threads.lock();
        let next = take_highest(&mut state.waiters, &table);
        state.holder = next.as_ref().map(ParkHandle::tid);
        match next.as_ref() {
            Some(next) => {
                table.lock_holders.insert(self.id(), next.tid());
                table.get_mut(next.tid()).lock_waiting = None;
                table.refresh_priority(next.tid());
            }
            None => {
                table.lock_holders.remove(&self.id());
            }
        }
        table.refresh_priority(me);
        table.unlock();
        state.unlock();
        if let Some(next) = next {
            next.unpark();
        }
        thread::preempt();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Proof that the current thread holds a [`Mutex`].
///
/// The guard has to be given back with [`MutexGuard::unlock`]; dropping a
/// guard that still holds the mutex panics.
pub struct MutexGuard<'a, T: 'a> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> MutexGuard<'_, T> {
    /// Hands the mutex to its highest-priority waiter, or frees it.
    pub fn unlock(self) {
        self.lock.release();
        core::mem::forget(self);
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("MutexGuard dropped without calling `.unlock()`.");
        }
    }
}
