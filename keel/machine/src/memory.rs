//! Physical memory.
//!
//! Physical frames are split into two pools. The kernel pool backs kernel
//! data structures such as thread pages; the user pool backs pages mapped
//! into user processes. Every frame is addressed through its kernel virtual
//! address, starting 1 MiB above [`PHYS_BASE`].

use crate::{
    addressing::{Kva, PAGE_SIZE, PHYS_BASE},
    spinlock::SpinLock,
};

bitflags::bitflags! {
    /// Flags for [`PhysicalMemory::alloc`].
    pub struct PallocFlags: u32 {
        /// Zero the frame before returning it.
        const ZERO = 1 << 0;
        /// Take the frame from the user pool.
        const USER = 1 << 1;
    }
}

const POOL_BASE: usize = PHYS_BASE + 0x0010_0000;

struct Pool {
    first: usize,
    used: Vec<bool>,
}

impl Pool {
    fn take(&mut self) -> Option<usize> {
        let idx = self.used.iter().position(|used| !used)?;
        self.used[idx] = true;
        Some(self.first + idx)
    }

    fn contains(&self, frame: usize) -> bool {
        frame >= self.first && frame < self.first + self.used.len()
    }
}

/// Physical memory of the machine.
pub struct PhysicalMemory {
    kernel: SpinLock<Pool>,
    user: SpinLock<Pool>,
    frames: Vec<SpinLock<Box<[u8]>>>,
}

impl PhysicalMemory {
    pub fn new(kernel_frames: usize, user_frames: usize) -> Self {
        Self {
            kernel: SpinLock::new(Pool {
                first: 0,
                used: vec![false; kernel_frames],
            }),
            user: SpinLock::new(Pool {
                first: kernel_frames,
                used: vec![false; user_frames],
            }),
            frames: (0..kernel_frames + user_frames)
                .map(|_| SpinLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
                .collect(),
        }
    }

    fn frame_index(&self, kva: Kva) -> Option<usize> {
        let addr = kva.into_usize().checked_sub(POOL_BASE)?;
        let idx = addr / PAGE_SIZE;
        (idx < self.frames.len()).then_some(idx)
    }

    fn pool_of(&self, idx: usize) -> &SpinLock<Pool> {
        let kernel = self.kernel.lock();
        let in_kernel = kernel.contains(idx);
        kernel.unlock();
        if in_kernel { &self.kernel } else { &self.user }
    }

    fn index_allocated(&self, idx: usize) -> bool {
        let pool = self.pool_of(idx).lock();
        let used = pool.used[idx - pool.first];
        pool.unlock();
        used
    }

    fn checked_frame(&self, kva: Kva, len: usize) -> usize {
        let idx = self
            .frame_index(kva)
            .unwrap_or_else(|| panic!("{kva:?} is not backed by physical memory"));
        assert!(
            kva.offset() + len <= PAGE_SIZE,
            "Access to {kva:?} of {len} bytes crosses a frame boundary"
        );
        assert!(self.index_allocated(idx), "Access to free frame {kva:?}");
        idx
    }

    /// Allocates a frame.
    pub fn alloc(&self, flags: PallocFlags) -> Option<Kva> {
        let mut pool = if flags.contains(PallocFlags::USER) {
            self.user.lock()
        } else {
            self.kernel.lock()
        };
        let idx = pool.take();
        pool.unlock();
        let kva = Kva::new(POOL_BASE + idx? * PAGE_SIZE)?;
        if flags.contains(PallocFlags::ZERO) {
            self.fill(kva, 0, PAGE_SIZE);
        }
        Some(kva)
    }

    /// Returns a frame to its pool.
    pub fn free(&self, kva: Kva) {
        assert_eq!(kva.offset(), 0, "Freeing unaligned frame {kva:?}");
        let idx = self
            .frame_index(kva)
            .unwrap_or_else(|| panic!("{kva:?} is not backed by physical memory"));
        let mut pool = self.pool_of(idx).lock();
        let slot = idx - pool.first;
        let was_used = std::mem::replace(&mut pool.used[slot], false);
        pool.unlock();
        assert!(was_used, "Freeing a frame that is not allocated: {kva:?}");
    }

    /// Is `kva` part of an allocated frame?
    pub fn is_allocated(&self, kva: Kva) -> bool {
        self.frame_index(kva)
            .is_some_and(|idx| self.index_allocated(idx))
    }

    /// Number of free frames in the user pool.
    pub fn free_user_frames(&self) -> usize {
        let pool = self.user.lock();
        let free = pool.used.iter().filter(|used| !**used).count();
        pool.unlock();
        free
    }

    /// Number of free frames in the kernel pool.
    pub fn free_kernel_frames(&self) -> usize {
        let pool = self.kernel.lock();
        let free = pool.used.iter().filter(|used| !**used).count();
        pool.unlock();
        free
    }

    /// Copies bytes at `kva` into `buf`.
    pub fn read(&self, kva: Kva, buf: &mut [u8]) {
        let idx = self.checked_frame(kva, buf.len());
        let frame = self.frames[idx].lock();
        buf.copy_from_slice(&frame[kva.offset()..kva.offset() + buf.len()]);
        frame.unlock();
    }

    /// Copies `data` to `kva`.
    pub fn write(&self, kva: Kva, data: &[u8]) {
        let idx = self.checked_frame(kva, data.len());
        let mut frame = self.frames[idx].lock();
        frame[kva.offset()..kva.offset() + data.len()].copy_from_slice(data);
        frame.unlock();
    }

    /// Fills `len` bytes at `kva` with `byte`.
    pub fn fill(&self, kva: Kva, byte: u8, len: usize) {
        let idx = self.checked_frame(kva, len);
        let mut frame = self.frames[idx].lock();
        frame[kva.offset()..kva.offset() + len].fill(byte);
        frame.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_are_disjoint() {
        let memory = PhysicalMemory::new(1, 2);
        let k = memory.alloc(PallocFlags::empty()).unwrap();
        assert!(memory.alloc(PallocFlags::empty()).is_none());
        let u1 = memory.alloc(PallocFlags::USER).unwrap();
        let u2 = memory.alloc(PallocFlags::USER | PallocFlags::ZERO).unwrap();
        assert!(memory.alloc(PallocFlags::USER).is_none());
        assert!(k < u1 && u1 < u2);
        assert_eq!(memory.free_user_frames(), 0);
        memory.free(u1);
        assert_eq!(memory.free_user_frames(), 1);
        assert_eq!(memory.alloc(PallocFlags::USER), Some(u1));
    }

    #[test]
    fn zeroed_allocation() {
        let memory = PhysicalMemory::new(1, 0);
        let kva = memory.alloc(PallocFlags::empty()).unwrap();
        memory.write(kva + 10, b"dirty");
        memory.free(kva);
        let kva = memory.alloc(PallocFlags::ZERO).unwrap();
        let mut buf = [0xffu8; 16];
        memory.read(kva, &mut buf);
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_free_panics() {
        let memory = PhysicalMemory::new(1, 0);
        let kva = memory.alloc(PallocFlags::empty()).unwrap();
        memory.free(kva);
        memory.free(kva);
    }
}
