//! Semaphore.
//!
//! A semaphore maintains a count of available permits together with the
//! resource they guard. [`Semaphore::down`] takes a permit, sleeping until one
//! is available; [`Semaphore::up`] returns one, waking the waiter with the
//! highest effective priority. A permit released while threads wait goes
//! straight to the woken thread, so a late arrival can never take it first.
//!
//! [`Semaphore::wait`] returns a [`SemaphorePermits`] guard that releases the
//! permit when dropped. A semaphore created with zero permits works as an
//! event: one thread `down`s to wait for it, another `up`s to signal it.
//!
//! ```ignore
//! let sema = Semaphore::new(3, state); // Up to 3 threads use `state` at once.
//!
//! let permit = sema.wait();
//! permit.work(); // Call a method defined on the `state`.
//! drop(permit);
//! ```

use super::{SpinLock, take_highest};
use crate::{
    kernel,
    thread::{self, Current, ParkHandle},
};
use core::ops::Deref;
use keel_machine::interrupt::InterruptGuard;

struct State {
    permits: usize,
    waiters: Vec<ParkHandle>,
}

/// Counting semaphore.
///
/// A semaphore maintains a set of permits and resource. Permits are used to
/// synchronize access to a shared resource. A semaphore differs from a mutex in
/// that it can allow more than one concurrent caller to access the shared
/// resource at a time.
pub struct Semaphore<T> {
    resource: T,
    state: SpinLock<State>,
}

impl<T> Semaphore<T> {
    /// Creates a new semaphore initialized with a specified number of permits.
    pub const fn new(permits: usize, resource: T) -> Self {
        Self {
            resource,
            state: SpinLock::new(State {
                permits,
                waiters: Vec::new(),
            }),
        }
    }

    /// Takes a permit, sleeping until one becomes available.
    pub fn down(&self) {
        let _guard = InterruptGuard::new();
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            state.unlock();
            return;
        }
        Current::park_with(|handle| {
            state.waiters.push(handle);
            state.unlock();
        });
    }

    /// Takes a permit if one is available, without sleeping.
    pub fn try_down(&self) -> bool {
        let mut state = self.state.lock();
        let taken = state.permits > 0;
        if taken {
            state.permits -= 1;
        }
        state.unlock();
        taken
    }

    /// Releases a permit.
    ///
    /// If threads are waiting, the permit goes to the one with the highest
    /// effective priority, and the caller yields if that thread outranks it.
    pub fn up(&self) {
        let woken = {
            let kernel = kernel();
            let mut state = self.state.lock();
            let woken = if state.waiters.is_empty() {
                state.permits += 1;
                None
            } else {
                let table = kernel.threads.lock();
                let woken = take_highest(&mut state.waiters, &table);
                table.unlock();
                woken
            };
            state.unlock();
            woken
        };
        if let Some(handle) = woken {
            handle.unpark();
            thread::preempt();
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    ///
    /// The permit is released when the returned guard is dropped.
    pub fn wait(&self) -> SemaphorePermits<'_, T> {
        self.down();
        SemaphorePermits { sema: self }
    }

    /// Number of permits currently available.
    pub fn permits(&self) -> usize {
        let state = self.state.lock();
        let permits = state.permits;
        state.unlock();
        permits
    }
}

/// An RAII implementation of a "scoped semaphore". When this structure
/// is dropped (falls out of scope), the semaphore will be signaled.
///
/// The data protected by the semaphore can be accessed through this guard via
/// its [`Deref`] implementations.
pub struct SemaphorePermits<'a, T> {
    sema: &'a Semaphore<T>,
}

impl<T> Deref for SemaphorePermits<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.sema.resource
    }
}

impl<T> Drop for SemaphorePermits<'_, T> {
    fn drop(&mut self) {
        // A thread that is torn down does not own the processor anymore.
        if !std::thread::panicking() {
            self.sema.up()
        }
    }
}
