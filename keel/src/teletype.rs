//! Character devices.
//!
//! [`Teletype`] is what the kernel needs from a terminal: a byte sink and a
//! byte source. [`Console`] implements it on the console of the machine the
//! kernel runs on, and backs the standard descriptors of user processes.

use crate::{KernelError, kernel};

/// A character-based terminal.
pub trait Teletype {
    /// Writes `data`, returning how many bytes were taken.
    fn write(&mut self, data: &[u8]) -> Result<usize, KernelError>;

    /// Fills `data` with pending input, returning how many bytes were read.
    /// Never waits for input that has not arrived yet.
    fn read(&mut self, data: &mut [u8]) -> Result<usize, KernelError>;
}

/// The console of the running kernel.
#[derive(Default)]
pub struct Console {
    _p: (),
}

impl Console {
    pub const fn new() -> Self {
        Self { _p: () }
    }
}

impl Teletype for Console {
    /// Writes `data` to the console device and echoes it to the host's
    /// standard output.
    fn write(&mut self, data: &[u8]) -> Result<usize, KernelError> {
        kernel().machine().console.put_bytes(data);
        print!("{}", String::from_utf8_lossy(data));
        Ok(data.len())
    }

    /// Reads the bytes typed so far, up to the size of `data`.
    fn read(&mut self, data: &mut [u8]) -> Result<usize, KernelError> {
        let kernel = kernel();
        let mut read = 0;
        for slot in data.iter_mut() {
            match kernel.machine().console.get_byte() {
                Some(b) => *slot = b,
                None => break,
            }
            read += 1;
        }
        Ok(read)
    }
}
