//! Kernel print utilities.
//!
//! [`kprint!`] and [`kprintln!`] write to the console of the machine the calling
//! thread runs on, which is what user-visible kernel output (such as the exit
//! line of a process) goes through. Diagnostics go through the `log` facade
//! instead; [`init_logger`] installs [`KernelLogger`], which writes them to
//! the host's standard error, the equivalent of a debug serial port.

use log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let s = fmt.to_string();
    if let Some(machine) = crate::cpu::machine() {
        machine.console.put_bytes(s.as_bytes());
    }
    print!("{s}");
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

/// `log` sink of the kernel.
pub struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let tid = crate::cpu::context_id().unwrap_or(0);
            let _ = writeln!(
                std::io::stderr(),
                "[{:5}] [{tid}] {}",
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs [`KernelLogger`] and sets the maximum level.
///
/// Installing twice is harmless; the level is updated either way.
pub fn init_logger(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
