//! Synchronization primitives.
//!
//! | Primitive     | Blocks thread? | Typical use                                  |
//! |---------------|----------------|----------------------------------------------|
//! | [`SpinLock`]  | No             | Short critical sections, scheduler state     |
//! | [`Mutex`]     | Yes            | Exclusive access with priority donation      |
//! | [`Semaphore`] | Yes            | Counting resources, one-shot event signaling |
//!
//! A [`SpinLock`] disables interrupts while held, so it must never be held
//! across a call that may block. [`Mutex`] and [`Semaphore`] put the waiting
//! thread to sleep and wake the waiter with the highest effective priority.

pub mod mutex;
pub mod semaphore;

pub use keel_machine::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, SemaphorePermits};

use crate::thread::{ParkHandle, scheduler::ThreadTable};

/// Removes the waiter with the highest effective priority. Among equals, the
/// one that waited longest wins.
pub(crate) fn take_highest(waiters: &mut Vec<ParkHandle>, table: &ThreadTable) -> Option<ParkHandle> {
    let mut best: Option<(usize, i32)> = None;
    for (idx, waiter) in waiters.iter().enumerate() {
        let priority = table.get(waiter.tid()).effective_priority();
        if best.is_none_or(|(_, p)| priority > p) {
            best = Some((idx, priority));
        }
    }
    best.map(|(idx, _)| waiters.remove(idx))
}
