//! # keel: a hosted educational kernel core
//!
//! keel is the execution core of a small uniprocessor kernel: threads and
//! their scheduler, the synchronization primitives built on top of it, and
//! the thin collaborators (file layer, console) that user processes need.
//! Processes and virtual memory live in the `keel-projects` crates and build
//! on the pieces exported here.
//!
//! ## The threading model
//!
//! The kernel runs on a simulated machine ([`keel_machine`]). Every kernel
//! thread is backed by a host thread, but the machine has exactly one CPU and
//! only the thread that holds it runs. The scheduler in [`thread`] decides
//! who gets the CPU next; control moves between threads only when a thread
//! blocks, yields, exits, or when a timer interrupt ([`timer`]) asks the
//! running thread to give up its time slice.
//!
//! Each test boots its own [`Kernel`]. Kernels share nothing, so tests may
//! run in parallel on the host.
//!
//! ## Implementation Notes
//!
//! Every thread owns a single kernel page that holds its canary. Kernel code
//! reaches the running thread through [`thread::with_current`], which checks
//! the canary on every access and panics with "Stack overflow detected" when
//! it has been clobbered.
//!
//! Panics inside the kernel are not recoverable: the machine halts and the
//! boot thread re-raises the panic as `Kernel panic: ...`.

pub mod config;
pub mod fixed_point;
pub mod fs;
pub mod sync;
pub mod teletype;
pub mod thread;
pub mod timer;

pub use keel_machine::{self, addressing, kprint, kprintln, paging, spinlock};
pub use keel_machine::{cpu::Halt, interrupt, memory::PallocFlags, paging::PageDirectory};

use config::Config;
use keel_machine::{
    Machine,
    cpu::{self, Stop},
};
use std::{
    cell::RefCell,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use thread::scheduler::ThreadTable;

/// Represents the possible errors that can occur in a keel kernel.
///
/// This enum is used to categorize errors encountered by the kernel operation.
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// No memory mapping with the given id.
    NoSuchMapping,
}

/// How a booted kernel stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Halted {
    /// Some thread powered the machine off.
    PowerOff,
}

/// A booted kernel instance.
pub struct Kernel {
    machine: Arc<Machine>,
    config: Config,
    pub(crate) threads: spinlock::SpinLock<ThreadTable>,
    pub(crate) fs: fs::FileSystem,
}

thread_local! {
    static KERNEL: RefCell<Option<Arc<Kernel>>> = const { RefCell::new(None) };
}

/// The kernel the calling thread runs on.
///
/// # Panics
/// Panics when called from a host thread that is not a kernel thread.
pub fn kernel() -> Arc<Kernel> {
    try_kernel().unwrap_or_else(|| panic!("Not running on a kernel thread."))
}

/// Like [`kernel`], but returns `None` outside of kernel threads.
pub fn try_kernel() -> Option<Arc<Kernel>> {
    KERNEL.with(|k| k.borrow().clone())
}

pub(crate) fn bind_kernel(kernel: Arc<Kernel>) {
    KERNEL.with(|k| *k.borrow_mut() = Some(kernel));
}

impl Kernel {
    /// Boots a kernel on a fresh machine.
    ///
    /// The calling host thread becomes the kernel's boot thread ("main",
    /// tid 1). The idle thread is started before this returns.
    pub fn boot(config: Config) -> Result<Arc<Kernel>, KernelError> {
        kprint::init_logger(config.log_level);
        let machine = Machine::new(config.machine);
        let threads = ThreadTable::new(&machine, &config)?;
        let kernel = Arc::new(Kernel {
            machine: machine.clone(),
            config,
            threads: spinlock::SpinLock::new(threads),
            fs: fs::FileSystem::new(),
        });
        cpu::bind(machine.clone(), thread::BOOT_TID, true);
        machine.cpu.claim(thread::BOOT_TID);
        bind_kernel(kernel.clone());
        interrupt::InterruptState::enable();
        log::info!(
            "keel: booting with {:?} scheduler, {} user frames",
            kernel.config.policy,
            kernel.config.machine.user_frames
        );
        thread::thread_start()?;
        Ok(kernel)
    }

    /// Runs `f` on the boot thread.
    ///
    /// Returns `Err(Halted::PowerOff)` when the machine is powered off
    /// while `f` runs. A kernel panic on any thread surfaces here as a panic
    /// whose message starts with `Kernel panic:`.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Result<R, Halted> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(r) => Ok(r),
            Err(payload) => match payload.downcast::<Stop>() {
                Ok(stop) if *stop == Stop::PowerOff => Err(Halted::PowerOff),
                Ok(stop) => panic::resume_unwind(stop),
                Err(payload) => {
                    // A panic on the boot thread halts every other thread too.
                    self.machine
                        .cpu
                        .halt(Halt::Panic(cpu::panic_message(&*payload)));
                    panic::resume_unwind(payload)
                }
            },
        }
    }

    /// The simulated machine.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// The configuration the kernel was booted with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The file system.
    pub fn fs(&self) -> &fs::FileSystem {
        &self.fs
    }

    /// Powers the machine off. Never returns.
    pub fn power_off(&self) -> ! {
        log::info!("keel: powering off");
        self.machine.cpu.power_off()
    }
}
