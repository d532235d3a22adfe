//! # keel-userprog: user processes
//!
//! This crate runs user programs on a keel kernel. A [`System`] ties the
//! shared state together: the virtual memory of the kernel and the table of
//! programs that can be executed.
//!
//! - [`process`] starts processes, waits for them and tears them down.
//! - [`loader`] builds a process's address space from an i386 ELF executable
//!   and lays its arguments out on the user stack.
//! - [`syscall`] decodes system calls from the user stack, and
//!   [`uaccess`] validates every user pointer they carry.
//! - [`file_struct`] holds each process's open files.
//! - [`exit_status`] is the record a parent and its child share.
//! - [`user`] is the interface user programs are written against.
//!
//! ```no_run
//! use keel::{Kernel, config::SystemConfigurationBuilder};
//! use keel_userprog::{System, loader::install_executable, user::ProgramTable};
//!
//! let kernel = Kernel::boot(SystemConfigurationBuilder::new().build()).unwrap();
//! let programs = ProgramTable::new().register("echo", |ctx| {
//!     let line = ctx.args().join(" ") + "\n";
//!     ctx.write_bytes(1, line.as_bytes());
//!     0
//! });
//! install_executable(kernel.fs(), "echo").unwrap();
//! let system = System::new(&kernel, programs);
//! let code = kernel.run(|| system.run_task("echo hello world")).unwrap();
//! assert_eq!(code, 0);
//! ```

pub mod exit_status;
pub mod file_struct;
pub mod loader;
pub mod process;
pub mod syscall;
pub mod uaccess;
pub mod user;

use exit_status::ExitStatus;
use keel::{Kernel, KernelError, thread::Tid};
use keel_vm::Vm;
use std::sync::Arc;
use user::ProgramTable;

pub use process::Process;

/// The state user processes of a kernel share.
pub struct System {
    vm: Arc<Vm>,
    programs: ProgramTable,
}

impl System {
    pub fn new(kernel: &Kernel, programs: ProgramTable) -> Arc<Self> {
        Arc::new(Self {
            vm: Vm::new(kernel),
            programs,
        })
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn programs(&self) -> &ProgramTable {
        &self.programs
    }

    /// Starts a process running `cmdline`, with the caller as its parent.
    pub fn execute(self: &Arc<Self>, cmdline: &str) -> Result<(Tid, ExitStatus), KernelError> {
        process::spawn(self, cmdline)
    }

    /// Runs `cmdline` to completion and returns its exit code, or `-1` if it
    /// could not be started.
    pub fn run_task(self: &Arc<Self>, cmdline: &str) -> i32 {
        match self.execute(cmdline) {
            Ok((_, status)) => status.wait(),
            Err(e) => {
                log::info!("userprog: cannot run {cmdline:?}: {e:?}");
                -1
            }
        }
    }
}
