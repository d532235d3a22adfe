//! Timer interrupt.
//!
//! The simulated machine has no free-running clock. Time advances when the
//! running thread takes a timer interrupt with [`timer_interrupt`], or a batch
//! of them with [`spin`], which stands in for CPU-bound work. The idle thread
//! also advances time while it runs.

use crate::{kernel, thread::Current};
use keel_machine::interrupt::{InterruptGuard, InterruptState};

/// Number of timer interrupts per second.
pub const TIMER_FREQ: u64 = 100;

/// Number of timer ticks since boot.
pub fn ticks() -> u64 {
    let kernel = kernel();
    let table = kernel.threads.lock();
    let ticks = table.ticks;
    table.unlock();
    ticks
}

/// Delivers one timer interrupt to the running thread.
///
/// The handler accounts the tick to the running thread and, once its time
/// slice is used up, yields after the handler returns.
#[track_caller]
pub fn timer_interrupt() {
    assert_eq!(
        InterruptState::current(),
        InterruptState::On,
        "Timer interrupt while interrupts are disabled."
    );
    let kernel = kernel();
    let cpu = &kernel.machine().cpu;
    {
        let _guard = InterruptGuard::new();
        cpu.enter_interrupt();
        let mut table = kernel.threads.lock();
        let yield_on_return = table.timer_tick();
        table.unlock();
        if yield_on_return {
            cpu.request_yield_on_return();
        }
        cpu.leave_interrupt();
    }
    if cpu.take_yield_on_return() {
        Current::yield_now();
    }
}

/// Runs for `ticks` timer ticks.
pub fn spin(ticks: u64) {
    for _ in 0..ticks {
        timer_interrupt();
    }
}
