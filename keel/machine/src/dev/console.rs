//! Console device.
//!
//! Output bytes are recorded so that whoever drives the machine can inspect
//! what the kernel printed. Input comes from a queue filled ahead of time,
//! standing in for a keyboard.

use crate::spinlock::SpinLock;
use std::collections::VecDeque;

pub struct Console {
    input: SpinLock<VecDeque<u8>>,
    output: SpinLock<Vec<u8>>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            input: SpinLock::new(VecDeque::new()),
            output: SpinLock::new(Vec::new()),
        }
    }

    /// Writes `buf` to the screen.
    pub fn put_bytes(&self, buf: &[u8]) {
        let mut output = self.output.lock();
        output.extend_from_slice(buf);
        output.unlock();
    }

    /// Takes the next typed byte, if any.
    pub fn get_byte(&self) -> Option<u8> {
        let mut input = self.input.lock();
        let byte = input.pop_front();
        input.unlock();
        byte
    }

    /// Types `bytes` on the keyboard.
    pub fn push_input(&self, bytes: &[u8]) {
        let mut input = self.input.lock();
        input.extend(bytes.iter().copied());
        input.unlock();
    }

    /// Everything printed so far.
    pub fn output(&self) -> String {
        let output = self.output.lock();
        let s = String::from_utf8_lossy(&output).into_owned();
        output.unlock();
        s
    }
}
