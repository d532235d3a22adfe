//! Interrupt level of the processor.
//!
//! Disabling interrupts is the kernel's primary tool for mutual exclusion on a
//! uniprocessor: with interrupts off, the timer cannot preempt the running
//! thread, so a sequence of operations on scheduler state appears atomic.
//!
//! [`InterruptGuard`] disables interrupts for as long as it lives and restores
//! the previous level when dropped. Guards nest naturally since each one
//! remembers the level it found.

use crate::cpu::with_cpu;
use std::marker::PhantomData;

/// Interrupt level.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the interrupt level of the running processor.
    ///
    /// A host thread that is not bound to a machine is treated as running
    /// with interrupts on.
    pub fn current() -> Self {
        match with_cpu(|cpu| cpu.interrupts_enabled()) {
            Some(false) => Self::Off,
            _ => Self::On,
        }
    }

    /// Enables interrupts.
    pub fn enable() {
        with_cpu(|cpu| cpu.set_interrupts(true));
    }

    /// Disables interrupts.
    pub fn disable() {
        with_cpu(|cpu| cpu.set_interrupts(false));
    }
}

/// Returns true while an external interrupt handler runs.
pub fn in_external_interrupt() -> bool {
    with_cpu(|cpu| cpu.in_interrupt()).unwrap_or(false)
}

/// Requests a yield right before the running interrupt handler returns.
pub fn yield_on_return() {
    with_cpu(|cpu| cpu.request_yield_on_return());
}

/// RAII guard that keeps interrupts disabled.
pub struct InterruptGuard {
    previous: InterruptState,
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Disables interrupts until the guard is dropped.
    pub fn new() -> Self {
        let previous = InterruptState::current();
        InterruptState::disable();
        Self {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Level that will be restored on drop.
    pub fn previous(&self) -> InterruptState {
        self.previous
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.previous == InterruptState::On {
            InterruptState::enable();
        }
    }
}
