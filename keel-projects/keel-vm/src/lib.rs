//! # keel-vm: virtual memory
//!
//! User memory in keel is populated on demand. Loading a program or mapping a
//! file only records, in the process's [supplemental page table], how each
//! page would be filled. The first access to such a page faults, and the
//! fault handler obtains a frame, fills it from its backing (zeroes, a file,
//! or swap) and maps it.
//!
//! Frames come from the user pool. When the pool is exhausted, the [`Vm`]
//! evicts a resident page chosen by the clock policy of the [frame table]:
//!
//! - a modified page of a memory-mapped file is written back to the file;
//! - any other modified page is written to a [swap slot], recorded in its
//!   supplemental page table entry;
//! - an unmodified page is dropped, since its backing can produce it again.
//!
//! The evicted page is unmapped so that its next access faults it back in.
//!
//! ## Locking
//!
//! The frame table is guarded by one [`Mutex`], held while a victim is
//! written out. Frames are pinned while they are populated so that they are
//! not chosen as victims before they are mapped. Supplemental page tables are
//! behind spinlocks that are never held across I/O. When both are needed,
//! the frame table lock comes first, and file system operations nest inside
//! it.
//!
//! [supplemental page table]: page
//! [frame table]: frame
//! [swap slot]: swap

pub mod frame;
pub mod mm_struct;
pub mod mmap;
pub mod page;
pub mod swap;

use frame::{Frame, FrameOwner, FrameTable};
use keel::{
    Kernel, KernelError, PallocFlags,
    addressing::{Kva, PAGE_SIZE, Va},
    keel_machine::Machine,
    paging::PageDirectory,
    sync::Mutex,
};
use page::FileBacking;
use std::sync::Arc;
use swap::SwapTable;

pub use mm_struct::MmStruct;

/// Virtual memory state shared by every process of a kernel.
pub struct Vm {
    machine: Arc<Machine>,
    frames: Mutex<FrameTable>,
    swap: SwapTable,
}

impl Vm {
    pub fn new(kernel: &Kernel) -> Arc<Self> {
        let machine = kernel.machine().clone();
        Arc::new(Self {
            swap: SwapTable::new(machine.clone()),
            frames: Mutex::new(FrameTable::new()),
            machine,
        })
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Obtains a frame for `owner`, evicting a page if the user pool is
    /// exhausted.
    ///
    /// The frame is returned pinned; the caller unpins it with
    /// [`Vm::unpin`] once the page is populated and mapped.
    ///
    /// # Errors
    /// [`KernelError::NoMemory`] if every frame is pinned or swap is full.
    pub fn get_free_frame(&self, owner: FrameOwner) -> Result<Kva, KernelError> {
        let mut frames = self.frames.lock();
        let result = match self.machine.memory.alloc(PallocFlags::USER) {
            Some(kva) => Ok(kva),
            None => self.evict(&mut frames),
        };
        if let Ok(kva) = result {
            frames.insert(Frame {
                kva,
                owner,
                pinned: true,
            });
        }
        frames.unlock();
        result
    }

    /// Frees a victim of the clock and returns it.
    fn evict(&self, frames: &mut FrameTable) -> Result<Kva, KernelError> {
        let Some(kva) = frames.pick_victim() else {
            log::warn!("vm: every frame is pinned");
            return Err(KernelError::NoMemory);
        };
        let FrameOwner { upage, dir, spt } = frames
            .get(kva)
            .map(|frame| frame.owner.clone())
            .unwrap_or_else(|| panic!("Victim {kva:?} is not in the frame table."));

        let table = spt.lock();
        let entry = table.find_addr(upage).cloned();
        table.unlock();
        let dirty = dir.is_dirty(upage);
        let write_back = entry.as_ref().and_then(|e| e.write_back().cloned());

        // Anonymous pages go to swap while still mapped, so a full swap
        // leaves the owner untouched.
        let slot = match (dirty, &write_back, &entry) {
            (true, None, Some(_)) => match self.swap.swap_out(kva) {
                Ok(slot) => Some(slot),
                Err(e) => {
                    log::warn!("vm: cannot evict {upage:?}: {e:?}");
                    return Err(KernelError::NoMemory);
                }
            },
            _ => None,
        };

        // The owner faults on the page from now on, and its fault waits for
        // the frame table lock held here.
        dir.clear_page(upage);
        if let Some(backing) = write_back.filter(|_| dirty) {
            self.write_back(kva, &backing);
        }
        if let Some(slot) = slot {
            let mut table = spt.lock();
            match table.find_addr_mut(upage) {
                Some(entry) => entry.swap_slot = Some(slot),
                None => self.swap.release(slot),
            }
            table.unlock();
        }
        log::trace!("vm: evicted {upage:?} from {kva:?}");
        frames.remove(kva);
        Ok(kva)
    }

    /// Writes the page at `kva` back to its file.
    fn write_back(&self, kva: Kva, backing: &FileBacking) {
        let mut buf = vec![0u8; backing.read_bytes];
        self.machine.memory.read(kva, &mut buf);
        let written = backing.file.write_at(&buf, backing.offset);
        if written != buf.len() {
            log::warn!(
                "vm: wrote back {written} of {} bytes at offset {}",
                buf.len(),
                backing.offset
            );
        }
    }

    /// Unpins a frame obtained from [`Vm::get_free_frame`].
    pub fn unpin(&self, kva: Kva) {
        let mut frames = self.frames.lock();
        frames.unpin(kva);
        frames.unlock();
    }

    /// Returns a frame to the user pool.
    pub fn free_frame(&self, kva: Kva) {
        let mut frames = self.frames.lock();
        frames.remove(kva);
        frames.unlock();
        self.machine.memory.free(kva);
    }

    /// Unmaps `upage` from `dir` and frees its frame, if it is resident.
    ///
    /// A modified page is first written back to `write_back`, if given.
    pub fn unmap_page(&self, dir: &PageDirectory, upage: Va, write_back: Option<&FileBacking>) {
        let mut frames = self.frames.lock();
        if let Some(kva) = dir.get_page(upage) {
            if let Some(backing) = write_back {
                if dir.is_dirty(upage) {
                    self.write_back(kva, backing);
                }
            }
            dir.clear_page(upage);
            frames.remove(kva);
            self.machine.memory.free(kva);
        }
        frames.unlock();
    }

    /// Resident pages of `dir` according to the frame table.
    pub fn resident_pages(&self, dir: &PageDirectory) -> Vec<(Kva, Va)> {
        let frames = self.frames.lock();
        let pages = frames.frames_of(dir);
        frames.unlock();
        pages
    }

    /// Number of frames in use by user pages.
    pub fn frames_in_use(&self) -> usize {
        let frames = self.frames.lock();
        let n = frames.len();
        frames.unlock();
        n
    }
}

/// Number of pages needed to hold `len` bytes.
pub fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}
