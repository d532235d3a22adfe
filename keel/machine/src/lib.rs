//! The machine underneath keel.
//!
//! This crate models the hardware that the kernel runs on: a single CPU that
//! executes exactly one kernel thread at a time, an interrupt flag, physical
//! memory split into a kernel pool and a user pool, a hardware page directory
//! that maintains accessed and dirty bits, a sector-addressed disk used as the
//! swap device, and a console.
//!
//! Kernel threads are backed by host threads, but only the thread holding the
//! CPU runs. Handing the CPU to another thread ([`cpu::Cpu::switch`]) is the
//! opaque "switch to thread" primitive the scheduler is built on. Because of
//! this, the kernel observes the same interleavings it would on a real
//! uniprocessor: nothing runs concurrently, and control only moves between
//! threads at explicit switch points.
//!
//! You are not supposed to reach into this crate from kernel code that
//! implements policy. The [`keel`] crate re-exports what it needs.
//!
//! [`keel`]: ../keel/index.html

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod cpu;
pub mod dev;
pub mod interrupt;
pub mod memory;
pub mod paging;
pub mod spinlock;

use std::sync::Arc;

use cpu::Cpu;
use dev::{console::Console, disk::Disk};
use memory::PhysicalMemory;

/// Sizes of the simulated hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    /// Number of frames in the kernel pool.
    pub kernel_frames: usize,
    /// Number of frames in the user pool.
    pub user_frames: usize,
    /// Number of 512-byte sectors on the swap disk.
    pub swap_sectors: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            kernel_frames: 256,
            user_frames: 256,
            swap_sectors: 8 * 1024,
        }
    }
}

/// A single simulated machine.
pub struct Machine {
    /// The only processor.
    pub cpu: Cpu,
    /// Physical memory.
    pub memory: PhysicalMemory,
    /// The disk that backs swap.
    pub swap_disk: Disk,
    /// Console device.
    pub console: Console,
}

impl Machine {
    /// Powers on a machine.
    pub fn new(config: MachineConfig) -> Arc<Self> {
        Arc::new(Self {
            cpu: Cpu::new(),
            memory: PhysicalMemory::new(config.kernel_frames, config.user_frames),
            swap_disk: Disk::new(config.swap_sectors),
            console: Console::new(),
        })
    }
}
