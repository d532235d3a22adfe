//! Swap table.
//!
//! The swap disk is divided into slots of [`SECTORS_PER_SLOT`] consecutive
//! sectors, each holding exactly one page. Free slots are kept in a lock-free
//! queue: swapping a page out pops a slot, and swapping it back in (or
//! discarding it) pushes the slot back.

use crossbeam_queue::ArrayQueue;
use keel::{
    KernelError,
    addressing::{Kva, PAGE_SIZE},
    keel_machine::{Machine, dev::disk::SECTOR_SIZE},
};
use std::sync::Arc;

/// Number of sectors that hold one page.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// Index of a swap slot.
pub type SwapSlot = usize;

/// Table of swap slots on the swap disk of a machine.
pub struct SwapTable {
    machine: Arc<Machine>,
    free: Option<ArrayQueue<SwapSlot>>,
}

impl SwapTable {
    /// Creates a swap table covering the whole swap disk.
    pub fn new(machine: Arc<Machine>) -> Self {
        let slots = machine.swap_disk.size() / SECTORS_PER_SLOT;
        // ArrayQueue cannot be empty; a disk without slots has no queue.
        let free = (slots > 0).then(|| {
            let queue = ArrayQueue::new(slots);
            for slot in 0..slots {
                let _ = queue.push(slot);
            }
            queue
        });
        log::debug!("swap: {slots} slots");
        Self { machine, free }
    }

    /// Number of slots that are not in use.
    pub fn free_slots(&self) -> usize {
        self.free.as_ref().map_or(0, ArrayQueue::len)
    }

    /// Writes the page at `kva` to a free slot and returns the slot.
    ///
    /// Fails with [`KernelError::NoSpace`] when swap is full.
    pub fn swap_out(&self, kva: Kva) -> Result<SwapSlot, KernelError> {
        let slot = self
            .free
            .as_ref()
            .and_then(ArrayQueue::pop)
            .ok_or(KernelError::NoSpace)?;
        let mut sector = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_SLOT {
            self.machine.memory.read(kva + i * SECTOR_SIZE, &mut sector);
            self.machine
                .swap_disk
                .write(slot * SECTORS_PER_SLOT + i, &sector);
        }
        log::trace!("swap: {kva:?} -> slot {slot}");
        Ok(slot)
    }

    /// Reads `slot` into the page at `kva` and releases the slot.
    pub fn swap_in(&self, slot: SwapSlot, kva: Kva) {
        let mut sector = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_SLOT {
            self.machine
                .swap_disk
                .read(slot * SECTORS_PER_SLOT + i, &mut sector);
            self.machine.memory.write(kva + i * SECTOR_SIZE, &sector);
        }
        log::trace!("swap: slot {slot} -> {kva:?}");
        self.release(slot);
    }

    /// Releases `slot` without reading it.
    pub fn release(&self, slot: SwapSlot) {
        if let Some(free) = self.free.as_ref() {
            assert!(free.push(slot).is_ok(), "Swap slot {slot} released twice.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel::keel_machine::{MachineConfig, memory::PallocFlags};

    fn machine(swap_sectors: usize) -> Arc<Machine> {
        Machine::new(MachineConfig {
            kernel_frames: 1,
            user_frames: 2,
            swap_sectors,
        })
    }

    #[test]
    fn page_survives_a_round_trip() {
        let machine = machine(16);
        let swap = SwapTable::new(machine.clone());
        assert_eq!(swap.free_slots(), 2);

        let kva = machine.memory.alloc(PallocFlags::USER).unwrap();
        let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        machine.memory.write(kva, &pattern);
        let slot = swap.swap_out(kva).unwrap();
        assert_eq!(swap.free_slots(), 1);

        machine.memory.fill(kva, 0, PAGE_SIZE);
        swap.swap_in(slot, kva);
        let mut back = vec![0u8; PAGE_SIZE];
        machine.memory.read(kva, &mut back);
        assert_eq!(back, pattern);
        assert_eq!(swap.free_slots(), 2);
    }

    #[test]
    fn full_swap_is_an_error() {
        let machine = machine(SECTORS_PER_SLOT);
        let swap = SwapTable::new(machine.clone());
        let kva = machine.memory.alloc(PallocFlags::USER).unwrap();
        let slot = swap.swap_out(kva).unwrap();
        assert_eq!(swap.swap_out(kva), Err(KernelError::NoSpace));
        swap.release(slot);
        assert!(swap.swap_out(kva).is_ok());
    }

    #[test]
    fn no_swap_disk() {
        let machine = machine(0);
        let swap = SwapTable::new(machine.clone());
        let kva = machine.memory.alloc(PallocFlags::USER).unwrap();
        assert_eq!(swap.free_slots(), 0);
        assert_eq!(swap.swap_out(kva), Err(KernelError::NoSpace));
    }
}
