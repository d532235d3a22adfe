//! Thread abstraction.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. Threads are created with [`ThreadBuilder`], and
//! the running thread is accessed through [`Current`] and [`with_current`].
//!
//! A thread moves through the states of [`ThreadState`]:
//!
//! ```text
//! Blocked -> Ready -> Running -> { Ready | Blocked | Dying }
//! ```
//!
//! A new thread starts blocked and is unblocked right away. A dying thread
//! cannot free the stack it still runs on, so it is destroyed by whichever
//! thread runs after it, once that thread has been switched in.
//!
//! Every thread owns one page of the kernel pool. [`THREAD_MAGIC`] is written
//! into that page when the thread is created and is checked whenever the
//! running thread is accessed. A mismatch means the thread overran its stack
//! and is a kernel panic.
mod donation;
mod mlfqs;
pub mod scheduler;

use crate::{
    Kernel, KernelError,
    config::SchedulingPolicy,
    fixed_point::Fixed,
    kernel, kprintln,
    sync::Semaphore,
};
use keel_machine::{
    addressing::Kva,
    cpu,
    interrupt::{self, InterruptGuard, InterruptState},
    paging::PageDirectory,
};
use std::sync::Arc;

pub use scheduler::Stats;

/// Thread identifier.
pub type Tid = u64;

/// Identifies a lock for the purpose of priority donation.
pub(crate) type LockId = usize;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

pub const NICE_MIN: i32 = -20;
pub const NICE_DEFAULT: i32 = 0;
pub const NICE_MAX: i32 = 20;

/// Maximum number of holders a donation is propagated through.
pub const DONATION_DEPTH: usize = 8;

/// Thread magic to detect stack overflow.
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;
/// Offset of [`THREAD_MAGIC`] within the thread's page.
pub const MAGIC_OFFSET: usize = 0;

/// Tid of the boot thread.
pub const BOOT_TID: Tid = 1;

const NAME_MAX: usize = 15;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is running.
    Running,
    /// Thread is runnable.
    Ready,
    /// Thread waits for an event.
    Blocked,
    /// Thread has exited and waits to be destroyed.
    Dying,
}

/// A thread control block.
pub struct Thread {
    /// Thread id
    pub tid: Tid,
    /// Thread name
    pub name: String,
    pub(crate) state: ThreadState,
    /// Base priority.
    pub(crate) priority: i32,
    /// Base priority combined with donations.
    pub(crate) effective: i32,
    pub(crate) nice: i32,
    pub(crate) recent_cpu: Fixed,
    /// The lock this thread is blocked on.
    pub(crate) lock_waiting: Option<LockId>,
    /// Page of the kernel pool backing this thread.
    pub(crate) page: Kva,
    /// Page directory activated while the thread runs, for user processes.
    pub(crate) page_directory: Option<PageDirectory>,
    /// Signaled when the thread exits.
    pub(crate) exit_notify: Option<Arc<Semaphore<()>>>,
}

impl Thread {
    pub(crate) fn new(tid: Tid, name: &str, priority: i32, page: Kva) -> Self {
        let mut end = name.len().min(NAME_MAX);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            tid,
            name: name[..end].to_string(),
            state: ThreadState::Blocked,
            priority,
            effective: priority,
            nice: NICE_DEFAULT,
            recent_cpu: Fixed::ZERO,
            lock_waiting: None,
            page,
            page_directory: None,
            exit_notify: None,
        }
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Base priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Priority the scheduler uses, including donations.
    pub fn effective_priority(&self) -> i32 {
        self.effective
    }

    /// The kernel page owned by this thread.
    pub fn page(&self) -> Kva {
        self.page
    }

    pub fn page_directory(&self) -> Option<&PageDirectory> {
        self.page_directory.as_ref()
    }
}

/// Run a function `f` with current thread as an argument.
///
/// `f` runs with the scheduler locked and must not block.
#[track_caller]
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    let kernel = kernel();
    let mut table = kernel.threads.lock();
    let tid = table.running;
    debug_assert_eq!(cpu::context_id(), Some(tid));
    let th = table.current();
    let mut magic = [0u8; 4];
    kernel
        .machine()
        .memory
        .read(th.page + MAGIC_OFFSET, &mut magic);
    if u32::from_le_bytes(magic) != THREAD_MAGIC {
        let name = th.name.clone();
        table.unlock();
        panic!("Stack overflow detected! Thread `{name}` ({tid}) clobbered its magic.");
    }
    let r = f(th);
    table.unlock();
    r
}

/// The opaque structure indicating the running thread on the cpu.
pub struct Current {
    _p: (),
}

impl Current {
    /// Get the current thread's id.
    pub fn get_tid() -> Tid {
        with_current(|th| th.tid)
    }

    /// Run a function `f` with [`ParkHandle`] for current thread, and then
    /// park the current thread.
    ///
    /// `f` runs with interrupts disabled after the thread has been marked
    /// blocked; it typically stashes the handle where a waker will find it.
    /// The thread resumes once somebody calls [`ParkHandle::unpark`].
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        let _guard = InterruptGuard::new();
        let tid = with_current(|th| {
            th.state = ThreadState::Blocked;
            th.tid
        });
        f(ParkHandle { tid });
        scheduler::reschedule(&kernel());
    }

    /// Blocks the running thread until it is unblocked.
    ///
    /// Must be called with interrupts disabled, outside of interrupt context.
    #[track_caller]
    pub fn block() {
        assert!(
            !interrupt::in_external_interrupt(),
            "Blocking inside an interrupt handler."
        );
        assert_eq!(
            InterruptState::current(),
            InterruptState::Off,
            "Blocking with interrupts on."
        );
        with_current(|th| th.state = ThreadState::Blocked);
        scheduler::reschedule(&kernel());
    }

    /// Yields the cpu. The current thread goes to the back of the ready
    /// queue and may be scheduled again immediately.
    pub fn yield_now() {
        assert!(
            !interrupt::in_external_interrupt(),
            "Yielding inside an interrupt handler."
        );
        let _guard = InterruptGuard::new();
        let kernel = kernel();
        let mut table = kernel.threads.lock();
        let me = table.running;
        table.push_to_queue(me);
        table.unlock();
        scheduler::reschedule(&kernel);
    }

    /// Exits the current thread. Never returns.
    ///
    /// The thread is marked dying and the processor is handed to the next
    /// thread, which destroys this one.
    pub fn exit() -> ! {
        assert!(
            !interrupt::in_external_interrupt(),
            "Exiting inside an interrupt handler."
        );
        let kernel = kernel();
        if let Some(notify) = with_current(|th| th.exit_notify.take()) {
            notify.up();
        }
        InterruptState::disable();
        let mut table = kernel.threads.lock();
        let me = table.running;
        assert_ne!(me, BOOT_TID, "The boot thread cannot exit.");
        assert!(!table.is_idle(me), "The idle thread cannot exit.");
        table.all.remove(&me);
        table.current().state = ThreadState::Dying;
        let (from, to) = table.pick_next();
        table.unlock();
        log::trace!("thread {from} exits, switching to {to}");
        cpu::mark_exiting();
        kernel.machine().cpu.hand_off(to);
        std::panic::resume_unwind(Box::new(cpu::Stop::Exited))
    }

    /// Installs `dir` as the page directory of the running thread and
    /// activates it.
    pub fn set_page_directory(dir: Option<PageDirectory>) {
        let _guard = InterruptGuard::new();
        with_current(|th| th.page_directory = dir.clone());
        kernel().machine().cpu.activate(dir);
    }
}

/// A handle that represent the parked thread.
pub struct ParkHandle {
    tid: Tid,
}

impl ParkHandle {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Consume the handle and unpark the underlying thread.
    ///
    /// The thread becomes ready but does not preempt the caller.
    pub fn unpark(self) {
        let kernel = kernel();
        let mut table = kernel.threads.lock();
        table.unblock(self.tid);
        table.unlock();
    }
}

/// A handle to join thread.
pub struct JoinHandle {
    /// Thread id of this handle.
    pub tid: Tid,
    exited: Arc<Semaphore<()>>,
}

impl JoinHandle {
    /// Blocks until the thread exits.
    pub fn join(self) {
        self.exited.down();
    }
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
            priority: PRI_DEFAULT,
        }
    }

    /// Sets the priority of the new thread. Ignored under MLFQS.
    pub fn priority(mut self, priority: i32) -> Self {
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "Priority {priority} out of range."
        );
        self.priority = priority;
        self
    }

    /// Spawn the thread.
    ///
    /// The new thread may run before this returns if it has a higher
    /// priority than the caller.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> Result<JoinHandle, KernelError> {
        let kernel = kernel();
        let machine = kernel.machine().clone();
        let page = scheduler::alloc_thread_page(&machine)?;
        let exited = Arc::new(Semaphore::new(0, ()));

        let mut table = kernel.threads.lock();
        let tid = table.allocate_tid();
        let mut th = Thread::new(tid, &self.name, self.priority, page);
        th.exit_notify = Some(exited.clone());
        if table.policy == SchedulingPolicy::Mlfqs {
            let parent = table.current();
            th.nice = parent.nice;
            th.recent_cpu = parent.recent_cpu;
            th.priority = mlfqs::priority(th.recent_cpu, th.nice);
            th.effective = th.priority;
        }
        let name = th.name.clone();
        table.threads.insert(tid, th);
        table.all.insert(tid);
        table.unlock();

        let entry_kernel = kernel.clone();
        let entry = Box::new(move || thread_main(entry_kernel, thread_fn));
        if let Err(e) = cpu::spawn_context(machine.clone(), tid, &name, entry) {
            log::error!("failed to start host thread for `{name}`: {e}");
            let mut table = kernel.threads.lock();
            table.threads.remove(&tid);
            table.all.remove(&tid);
            table.unlock();
            machine.memory.free(page);
            return Err(KernelError::NoMemory);
        }
        log::debug!("spawned thread `{name}` ({tid})");

        let _guard = InterruptGuard::new();
        let mut table = kernel.threads.lock();
        table.unblock(tid);
        table.unlock();
        preempt();
        Ok(JoinHandle { tid, exited })
    }
}

/// The very beginning of a thread.
fn thread_main<F: FnOnce()>(kernel: Arc<Kernel>, thread_fn: F) {
    crate::bind_kernel(kernel.clone());
    scheduler::schedule_tail(&kernel);
    InterruptState::enable();
    thread_fn();
    Current::exit()
}

/// Yields if a ready thread has a strictly higher priority than the running
/// one. Inside an interrupt handler, the yield is deferred until the handler
/// returns.
pub(crate) fn preempt() {
    let kernel = kernel();
    let mut table = kernel.threads.lock();
    let current = table.current().effective;
    let higher = table.max_ready_priority().is_some_and(|p| p > current);
    table.unlock();
    if higher {
        if interrupt::in_external_interrupt() {
            interrupt::yield_on_return();
        } else {
            Current::yield_now();
        }
    }
}

/// Yields if a ready thread has a priority at least as high as the running
/// one.
fn yield_to_equal_or_higher() {
    let kernel = kernel();
    let mut table = kernel.threads.lock();
    let current = table.current().effective;
    let yield_now = table.max_ready_priority().is_some_and(|p| p >= current);
    table.unlock();
    if yield_now {
        Current::yield_now();
    }
}

/// Starts preemptive scheduling by creating the idle thread.
pub(crate) fn thread_start() -> Result<(), KernelError> {
    let started = Arc::new(Semaphore::new(0, ()));
    let idle_started = started.clone();
    ThreadBuilder::new("idle")
        .priority(PRI_MIN)
        .spawn(move || idle(idle_started))?;
    started.down();
    Ok(())
}

/// The idle thread. Runs only when no other thread is ready.
fn idle(started: Arc<Semaphore<()>>) {
    let kernel = kernel();
    let mut table = kernel.threads.lock();
    let me = table.running;
    table.idle = Some(me);
    let th = table.current();
    th.priority = PRI_MIN;
    th.effective = PRI_MIN;
    table.unlock();
    started.up();

    loop {
        InterruptState::disable();
        Current::block();
        InterruptState::enable();

        crate::timer::timer_interrupt();
        let mut table = kernel.threads.lock();
        let ready = table.ready_count();
        table.unlock();
        if ready == 0 {
            panic!("every thread is blocked");
        }
    }
}

/// Sets the current thread's base priority.
///
/// Ignored under MLFQS. Yields if a ready thread now has a priority at least
/// as high as the running thread.
pub fn set_priority(priority: i32) {
    let kernel = kernel();
    if kernel.config().policy == SchedulingPolicy::Mlfqs {
        return;
    }
    let priority = priority.clamp(PRI_MIN, PRI_MAX);
    let _guard = InterruptGuard::new();
    let mut table = kernel.threads.lock();
    let me = table.running;
    table.current().priority = priority;
    table.refresh_priority(me);
    table.unlock();
    yield_to_equal_or_higher();
}

/// Returns the current thread's effective priority.
pub fn get_priority() -> i32 {
    with_current(|th| th.effective)
}

/// Sets the current thread's nice value and recomputes its priority.
pub fn set_nice(nice: i32) {
    let kernel = kernel();
    let nice = nice.clamp(NICE_MIN, NICE_MAX);
    let _guard = InterruptGuard::new();
    let mlfqs = kernel.config().policy == SchedulingPolicy::Mlfqs;
    with_current(|th| {
        th.nice = nice;
        if mlfqs {
            th.priority = mlfqs::priority(th.recent_cpu, nice);
            th.effective = th.priority;
        }
    });
    yield_to_equal_or_higher();
}

pub fn get_nice() -> i32 {
    with_current(|th| th.nice)
}

/// Returns 100 times the system load average, rounded to the nearest integer.
pub fn get_load_avg() -> i32 {
    let kernel = kernel();
    let table = kernel.threads.lock();
    let load = table.load_avg;
    table.unlock();
    (load * 100).round()
}

/// Returns 100 times the current thread's recent_cpu value, rounded to the
/// nearest integer.
pub fn get_recent_cpu() -> i32 {
    with_current(|th| (th.recent_cpu * 100).round())
}

fn with_thread<R>(tid: Tid, f: impl FnOnce(&Thread) -> R) -> Result<R, KernelError> {
    let kernel = kernel();
    let table = kernel.threads.lock();
    let r = table.threads.get(&tid).map(f);
    table.unlock();
    r.ok_or(KernelError::InvalidArgument)
}

/// Get specified thread's [`ThreadState`] by TID (Thread ID).
pub fn get_state_by_tid(tid: Tid) -> Result<ThreadState, KernelError> {
    with_thread(tid, |th| th.state)
}

/// Get specified thread's effective priority by TID (Thread ID).
pub fn get_priority_by_tid(tid: Tid) -> Result<i32, KernelError> {
    with_thread(tid, |th| th.effective)
}

/// Tick counters since boot.
pub fn stats() -> Stats {
    let kernel = kernel();
    let table = kernel.threads.lock();
    let stats = table.stats;
    table.unlock();
    stats
}

/// Prints thread statistics to the console.
pub fn print_stats() {
    let stats = stats();
    kprintln!(
        "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        stats.idle_ticks,
        stats.kernel_ticks,
        stats.user_ticks
    );
}
