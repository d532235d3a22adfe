//! Thread scheduler.
//!
//! All scheduler state lives in one [`ThreadTable`] guarded by a spinlock in
//! the [`Kernel`]. The table owns every thread control block, the ready
//! queue, and the bookkeeping of who holds which lock, so a single critical
//! section sees a consistent picture of the whole system.
//!
//! Two policies share this machinery and are selected at boot:
//!
//! - [`SchedulingPolicy::Priority`]: the ready thread with the highest
//!   effective priority runs next. Effective priorities include donations
//!   ([`super::donation`]).
//! - [`SchedulingPolicy::Mlfqs`]: priorities are recomputed from recent CPU
//!   usage and niceness ([`super::mlfqs`]); donation is disabled.

use super::{
    BOOT_TID, LockId, PRI_DEFAULT, THREAD_MAGIC, Thread, ThreadState, Tid, donation, mlfqs,
};
use crate::{
    Kernel, KernelError,
    config::{Config, SchedulingPolicy},
    fixed_point::Fixed,
    timer::TIMER_FREQ,
};
use keel_machine::{Machine, addressing::Kva, interrupt, memory::PallocFlags};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Tick counters, split by what the processor was doing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub idle_ticks: u64,
    pub kernel_ticks: u64,
    pub user_ticks: u64,
}

pub(crate) struct ThreadTable {
    pub(crate) threads: BTreeMap<Tid, Thread>,
    /// Every thread that has not exited yet.
    pub(crate) all: BTreeSet<Tid>,
    ready: VecDeque<Tid>,
    pub(crate) running: Tid,
    pub(crate) idle: Option<Tid>,
    /// The thread that ran before the current one, to be reaped if dying.
    prev: Option<Tid>,
    next_tid: Tid,
    pub(crate) lock_holders: BTreeMap<LockId, Tid>,
    pub(crate) policy: SchedulingPolicy,
    time_slice: u64,
    /// Ticks the running thread has consumed of its slice.
    slice: u64,
    pub(crate) ticks: u64,
    pub(crate) load_avg: Fixed,
    pub(crate) stats: Stats,
}

impl ThreadTable {
    /// Creates the table with the boot thread as its only member.
    pub(crate) fn new(machine: &Machine, config: &Config) -> Result<Self, KernelError> {
        let page = alloc_thread_page(machine)?;
        let mut main = Thread::new(BOOT_TID, "main", PRI_DEFAULT, page);
        main.state = ThreadState::Running;
        if config.policy == SchedulingPolicy::Mlfqs {
            main.priority = mlfqs::priority(main.recent_cpu, main.nice);
            main.effective = main.priority;
        }
        Ok(Self {
            threads: BTreeMap::from([(BOOT_TID, main)]),
            all: BTreeSet::from([BOOT_TID]),
            ready: VecDeque::new(),
            running: BOOT_TID,
            idle: None,
            prev: None,
            next_tid: BOOT_TID + 1,
            lock_holders: BTreeMap::new(),
            policy: config.policy,
            time_slice: config.time_slice,
            slice: 0,
            ticks: 0,
            load_avg: Fixed::ZERO,
            stats: Stats::default(),
        })
    }

    pub(crate) fn allocate_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    pub(crate) fn get(&self, tid: Tid) -> &Thread {
        self.threads
            .get(&tid)
            .unwrap_or_else(|| panic!("No thread with tid {tid}."))
    }

    pub(crate) fn get_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads
            .get_mut(&tid)
            .unwrap_or_else(|| panic!("No thread with tid {tid}."))
    }

    pub(crate) fn current(&mut self) -> &mut Thread {
        let tid = self.running;
        self.get_mut(tid)
    }

    pub(crate) fn is_idle(&self, tid: Tid) -> bool {
        self.idle == Some(tid)
    }

    /// Moves a blocked thread to the front of the ready queue.
    pub(crate) fn unblock(&mut self, tid: Tid) {
        let th = self.get_mut(tid);
        assert_eq!(
            th.state,
            ThreadState::Blocked,
            "Unblocking thread `{}` that is not blocked.",
            th.name
        );
        th.state = ThreadState::Ready;
        self.ready.push_front(tid);
    }

    /// Puts the running thread back to the tail of the ready queue.
    pub(crate) fn push_to_queue(&mut self, tid: Tid) {
        self.get_mut(tid).state = ThreadState::Ready;
        if !self.is_idle(tid) {
            self.ready.push_back(tid);
        }
    }

    /// Number of threads in the ready queue.
    pub(crate) fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Highest effective priority among ready threads.
    pub(crate) fn max_ready_priority(&self) -> Option<i32> {
        self.ready.iter().map(|tid| self.get(*tid).effective).max()
    }

    /// Removes the ready thread that runs next: the first one with the
    /// highest effective priority. Falls back to the idle thread.
    pub(crate) fn next_to_run(&mut self) -> Tid {
        let mut best: Option<(usize, i32)> = None;
        for (idx, tid) in self.ready.iter().enumerate() {
            let priority = self.get(*tid).effective;
            if best.is_none_or(|(_, p)| priority > p) {
                best = Some((idx, priority));
            }
        }
        match best.and_then(|(idx, _)| self.ready.remove(idx)) {
            Some(tid) => tid,
            None => self
                .idle
                .unwrap_or_else(|| panic!("No thread is ready to run.")),
        }
    }

    /// Hands the processor to the thread that runs next.
    ///
    /// Returns `(from, to)`. The caller has already moved the running thread
    /// out of the running state.
    pub(crate) fn pick_next(&mut self) -> (Tid, Tid) {
        let from = self.running;
        debug_assert_ne!(self.get(from).state, ThreadState::Running);
        let to = self.next_to_run();
        self.prev = Some(from);
        self.running = to;
        (from, to)
    }

    /// Recomputes the effective priority of `tid` and of every holder it
    /// transitively donates to.
    pub(crate) fn refresh_priority(&mut self, tid: Tid) {
        if self.policy == SchedulingPolicy::Mlfqs {
            return;
        }
        for (tid, priority) in donation::propagate(self, tid) {
            self.get_mut(tid).effective = priority;
        }
    }

    /// Accounts one timer tick to the running thread.
    ///
    /// Returns true if the running thread should yield when the interrupt
    /// returns.
    pub(crate) fn timer_tick(&mut self) -> bool {
        self.ticks += 1;
        let running = self.running;
        let idle = self.is_idle(running);
        if idle {
            self.stats.idle_ticks += 1;
        } else if self.get(running).page_directory.is_some() {
            self.stats.user_ticks += 1;
        } else {
            self.stats.kernel_ticks += 1;
        }

        let mut preempt = false;
        if self.policy == SchedulingPolicy::Mlfqs {
            if !idle {
                self.get_mut(running).recent_cpu += 1;
            }
            if self.ticks % TIMER_FREQ == 0 {
                let ready = self.ready.len() + usize::from(!idle);
                self.load_avg = mlfqs::load_avg(self.load_avg, ready);
                let coefficient = mlfqs::decay(self.load_avg);
                for tid in self.all.iter() {
                    if let Some(th) = self.threads.get_mut(tid) {
                        th.recent_cpu = mlfqs::recent_cpu(th.recent_cpu, coefficient, th.nice);
                    }
                }
            }
            if self.ticks % 4 == 0 {
                let idle_tid = self.idle;
                for tid in self.all.iter() {
                    if Some(*tid) == idle_tid {
                        continue;
                    }
                    if let Some(th) = self.threads.get_mut(tid) {
                        th.priority = mlfqs::priority(th.recent_cpu, th.nice);
                        th.effective = th.priority;
                    }
                }
                let current = self.get(running).effective;
                preempt = self.max_ready_priority().is_some_and(|p| p > current);
            }
        }

        self.slice += 1;
        preempt || self.slice >= self.time_slice
    }
}

pub(crate) fn alloc_thread_page(machine: &Machine) -> Result<Kva, KernelError> {
    let page = machine
        .memory
        .alloc(PallocFlags::ZERO)
        .ok_or(KernelError::NoMemory)?;
    machine
        .memory
        .write(page + super::MAGIC_OFFSET, &THREAD_MAGIC.to_le_bytes());
    Ok(page)
}

/// Switches to the next thread. The running thread must already be in a
/// non-running state and interrupts must be off.
///
/// Returns when the caller is scheduled again.
pub(crate) fn reschedule(kernel: &Kernel) {
    assert_eq!(
        interrupt::InterruptState::current(),
        interrupt::InterruptState::Off,
        "Rescheduling with interrupts on."
    );
    let mut table = kernel.threads.lock();
    let (from, to) = table.pick_next();
    table.unlock();
    if from != to {
        kernel.machine().cpu.switch(from, to);
    }
    schedule_tail(kernel);
}

/// Completes a switch on the thread that was switched to: marks it running,
/// starts a new time slice, activates its page directory and destroys the
/// previous thread if it was dying.
pub(crate) fn schedule_tail(kernel: &Kernel) {
    let mut table = kernel.threads.lock();
    let me = table.running;
    table.slice = 0;
    let th = table.get_mut(me);
    th.state = ThreadState::Running;
    let dir = th.page_directory.clone();
    let dead = match table.prev.take() {
        Some(prev) if prev != me && table.get(prev).state == ThreadState::Dying => {
            table.threads.remove(&prev)
        }
        _ => None,
    };
    table.unlock();
    kernel.machine().cpu.activate(dir);
    if let Some(dead) = dead {
        log::trace!("reaped thread `{}` ({})", dead.name, dead.tid);
        kernel.machine().memory.free(dead.page);
    }
}
