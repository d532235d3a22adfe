//! Devices attached to the machine.

pub mod console;
pub mod disk;
