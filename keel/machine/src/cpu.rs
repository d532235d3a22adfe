//! The processor.
//!
//! Every kernel thread runs on its own host thread, but the [`Cpu`] lets only
//! one of them make progress: the one whose context id holds the baton.
//! [`Cpu::switch`] passes the baton and parks the caller until it is handed
//! back, which is exactly what a context switch looks like from the point of
//! view of the thread being switched out.
//!
//! A host thread is bound to a machine and a context id with [`bind`]. The
//! binding is what lets interrupt guards and spinlocks find the processor
//! they run on.
//!
//! When the machine halts, either because it was powered off or because some
//! kernel thread panicked, every parked host thread is woken up and unwinds.
//! The boot thread surfaces the halt to its caller; all other threads vanish
//! silently.

use crate::{Machine, paging::PageDirectory};
use std::{
    any::Any,
    cell::RefCell,
    panic,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// Identifies the execution context (kernel thread) bound to a host thread.
pub type ContextId = u64;

/// Why the machine stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Halt {
    /// Orderly power off.
    PowerOff,
    /// A kernel thread panicked with the given message.
    Panic(String),
}

/// Unwinding payloads that carry a host thread out of the kernel.
#[derive(Debug, PartialEq, Eq)]
pub enum Stop {
    /// The kernel thread exited and handed the processor off.
    Exited,
    /// The boot thread observed a power off.
    PowerOff,
    /// The machine halted underneath a parked thread.
    Terminated,
}

struct Baton {
    running: ContextId,
    halt: Option<Halt>,
}

/// The single processor of a [`Machine`].
pub struct Cpu {
    baton: Mutex<Baton>,
    turn: Condvar,
    interrupts: AtomicBool,
    in_interrupt: AtomicBool,
    yield_on_return: AtomicBool,
    spinlocks: AtomicUsize,
    active: Mutex<Option<PageDirectory>>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    /// Creates a processor that nobody runs on yet.
    pub fn new() -> Self {
        Self {
            baton: Mutex::new(Baton {
                running: 0,
                halt: None,
            }),
            turn: Condvar::new(),
            interrupts: AtomicBool::new(true),
            in_interrupt: AtomicBool::new(false),
            yield_on_return: AtomicBool::new(false),
            spinlocks: AtomicUsize::new(0),
            active: Mutex::new(None),
        }
    }

    fn lock_baton(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until_running(&self, mut baton: MutexGuard<'_, Baton>, me: ContextId) {
        loop {
            if let Some(halt) = baton.halt.clone() {
                drop(baton);
                stop(halt);
            }
            if baton.running == me {
                return;
            }
            baton = self.turn.wait(baton).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Gives the processor to `id` without waiting. Used at boot.
    pub fn claim(&self, id: ContextId) {
        let mut baton = self.lock_baton();
        baton.running = id;
        self.turn.notify_all();
    }

    /// Context id currently holding the processor.
    pub fn running(&self) -> ContextId {
        self.lock_baton().running
    }

    /// Switches from `from` to `to`, returning when `from` is scheduled again.
    #[track_caller]
    pub fn switch(&self, from: ContextId, to: ContextId) {
        assert_eq!(
            self.spinlocks.load(Ordering::SeqCst),
            0,
            "Try to switch threads while holding a spinlock."
        );
        let mut baton = self.lock_baton();
        baton.running = to;
        self.turn.notify_all();
        self.wait_until_running(baton, from);
    }

    /// Hands the processor to `to` and never takes it back.
    pub fn hand_off(&self, to: ContextId) {
        let mut baton = self.lock_baton();
        baton.running = to;
        self.turn.notify_all();
    }

    /// Parks the caller until `me` holds the processor.
    pub fn wait_turn(&self, me: ContextId) {
        let baton = self.lock_baton();
        self.wait_until_running(baton, me);
    }

    /// Halts the machine. The first reason wins.
    pub fn halt(&self, why: Halt) {
        let mut baton = self.lock_baton();
        if baton.halt.is_none() {
            log::debug!("machine halted: {why:?}");
            baton.halt = Some(why);
        }
        self.turn.notify_all();
    }

    /// Halts the machine and stops the caller.
    pub fn power_off(&self) -> ! {
        self.halt(Halt::PowerOff);
        stop(Halt::PowerOff)
    }

    /// Why the machine stopped, if it did.
    pub fn halted(&self) -> Option<Halt> {
        self.lock_baton().halt.clone()
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Sets the interrupt flag, returning the previous value.
    pub fn set_interrupts(&self, on: bool) -> bool {
        self.interrupts.swap(on, Ordering::SeqCst)
    }

    pub fn enter_interrupt(&self) {
        assert!(
            !self.in_interrupt.swap(true, Ordering::SeqCst),
            "Nested external interrupt."
        );
    }

    pub fn leave_interrupt(&self) {
        self.in_interrupt.store(false, Ordering::SeqCst);
    }

    pub fn in_interrupt(&self) -> bool {
        self.in_interrupt.load(Ordering::SeqCst)
    }

    /// Asks for a yield once the running interrupt handler returns.
    pub fn request_yield_on_return(&self) {
        self.yield_on_return.store(true, Ordering::SeqCst);
    }

    pub fn take_yield_on_return(&self) -> bool {
        self.yield_on_return.swap(false, Ordering::SeqCst)
    }

    /// Installs `dir` as the page directory the MMU walks.
    pub fn activate(&self, dir: Option<PageDirectory>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = dir;
    }

    pub fn active_directory(&self) -> Option<PageDirectory> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn spinlock_acquired(&self) {
        self.spinlocks.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn spinlock_released(&self) {
        self.spinlocks.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Binding {
    machine: Arc<Machine>,
    id: ContextId,
    boot: bool,
    exiting: bool,
}

thread_local! {
    static BINDING: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

/// Binds the calling host thread to `machine` as context `id`.
pub fn bind(machine: Arc<Machine>, id: ContextId, boot: bool) {
    BINDING.with(|b| {
        *b.borrow_mut() = Some(Binding {
            machine,
            id,
            boot,
            exiting: false,
        })
    });
}

/// Drops the binding of the calling host thread.
pub fn unbind() {
    BINDING.with(|b| b.borrow_mut().take());
}

/// The machine the calling host thread is bound to.
pub fn machine() -> Option<Arc<Machine>> {
    BINDING.with(|b| b.borrow().as_ref().map(|b| b.machine.clone()))
}

/// The context id of the calling host thread.
pub fn context_id() -> Option<ContextId> {
    BINDING.with(|b| b.borrow().as_ref().map(|b| b.id))
}

/// Marks the calling context as gone. From now on the thread no longer owns
/// the processor, so guards it drops while unwinding must not touch it.
pub fn mark_exiting() {
    BINDING.with(|b| {
        if let Some(b) = b.borrow_mut().as_mut() {
            b.exiting = true;
        }
    });
}

/// Runs `f` on the processor of the calling context, if it still owns one.
pub(crate) fn with_cpu<R>(f: impl FnOnce(&Cpu) -> R) -> Option<R> {
    BINDING.with(|b| match b.borrow().as_ref() {
        Some(b) if !b.exiting => Some(f(&b.machine.cpu)),
        _ => None,
    })
}

fn stop(halt: Halt) -> ! {
    let boot = BINDING.with(|b| b.borrow().as_ref().is_some_and(|b| b.boot));
    mark_exiting();
    match (boot, halt) {
        (true, Halt::PowerOff) => panic::resume_unwind(Box::new(Stop::PowerOff)),
        (true, Halt::Panic(msg)) => panic!("Kernel panic: {msg}"),
        (false, _) => panic::resume_unwind(Box::new(Stop::Terminated)),
    }
}

/// Extracts the message of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Starts a host thread for context `id`.
///
/// The host thread parks until `id` is first scheduled, then runs `entry`.
/// `entry` is expected to leave by unwinding with [`Stop`]; any other panic
/// halts the machine.
pub fn spawn_context(
    machine: Arc<Machine>,
    id: ContextId,
    name: &str,
    entry: Box<dyn FnOnce() + Send>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            bind(machine.clone(), id, false);
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                machine.cpu.wait_turn(id);
                entry()
            }));
            if let Err(payload) = result {
                if !payload.is::<Stop>() {
                    machine.cpu.halt(Halt::Panic(panic_message(&*payload)));
                }
            }
            unbind();
        })
        .map(|_| ())
}
