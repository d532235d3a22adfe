//! Frame table.
//!
//! Every user-pool frame that backs a user page has a [`Frame`] record naming
//! the page it holds and the address space that owns it. Records live in an
//! arena and are reached through two indices over the same slots: a map from
//! kernel address to slot, and the clock ring that the eviction policy walks.
//! Both indices are updated together, so a frame is in the map exactly when
//! it is in the ring.
//!
//! ## Clock
//!
//! [`FrameTable::pick_victim`] implements second-chance replacement. The hand
//! keeps its position between calls. A pinned frame is skipped; a frame whose
//! page was accessed since the hand last passed gets its accessed bit cleared
//! and is skipped once; the first frame that is neither is the victim. The
//! hand makes at most two full sweeps, after which every frame is known to
//! be pinned and no victim exists.

use crate::page::SupplementalPageTable;
use keel::{
    addressing::{Kva, Va},
    paging::PageDirectory,
    spinlock::SpinLock,
};
use std::{collections::HashMap, sync::Arc};

/// The page a frame holds and the address space it belongs to.
#[derive(Clone)]
pub struct FrameOwner {
    pub upage: Va,
    pub dir: PageDirectory,
    pub spt: Arc<SpinLock<SupplementalPageTable>>,
}

/// A frame that backs a user page.
pub struct Frame {
    pub kva: Kva,
    pub owner: FrameOwner,
    /// Pinned frames are never evicted.
    pub pinned: bool,
}

#[derive(Default)]
pub struct FrameTable {
    arena: Vec<Option<Frame>>,
    vacant: Vec<usize>,
    by_kva: HashMap<Kva, usize>,
    ring: Vec<usize>,
    hand: usize,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames in the table.
    pub fn len(&self) -> usize {
        self.by_kva.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kva.is_empty()
    }

    /// Records a newly allocated frame. The frame enters the ring just
    /// behind the hand.
    pub fn insert(&mut self, frame: Frame) {
        let kva = frame.kva;
        assert!(
            !self.by_kva.contains_key(&kva),
            "Frame {kva:?} is already in the frame table."
        );
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.arena[slot] = Some(frame);
                slot
            }
            None => {
                self.arena.push(Some(frame));
                self.arena.len() - 1
            }
        };
        self.by_kva.insert(kva, slot);
        self.ring.insert(self.hand, slot);
        self.hand = (self.hand + 1) % self.ring.len();
    }

    /// Removes the frame at `kva` from the table.
    pub fn remove(&mut self, kva: Kva) -> Option<Frame> {
        let slot = self.by_kva.remove(&kva)?;
        let pos = self
            .ring
            .iter()
            .position(|s| *s == slot)
            .unwrap_or_else(|| panic!("Frame {kva:?} is missing from the clock ring."));
        self.ring.remove(pos);
        if pos < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.ring.len() {
            self.hand = 0;
        }
        self.vacant.push(slot);
        self.arena[slot].take()
    }

    pub fn get(&self, kva: Kva) -> Option<&Frame> {
        self.by_kva
            .get(&kva)
            .and_then(|slot| self.arena[*slot].as_ref())
    }

    pub fn get_mut(&mut self, kva: Kva) -> Option<&mut Frame> {
        self.by_kva
            .get(&kva)
            .and_then(|slot| self.arena[*slot].as_mut())
    }

    pub fn pin(&mut self, kva: Kva) {
        if let Some(frame) = self.get_mut(kva) {
            frame.pinned = true;
        }
    }

    pub fn unpin(&mut self, kva: Kva) {
        if let Some(frame) = self.get_mut(kva) {
            frame.pinned = false;
        }
    }

    /// Runs the clock and returns the victim, or `None` if every frame is
    /// pinned.
    pub fn pick_victim(&mut self) -> Option<Kva> {
        let len = self.ring.len();
        for _ in 0..2 * len {
            let slot = self.ring[self.hand];
            self.hand = (self.hand + 1) % len;
            let Some(frame) = self.arena[slot].as_ref() else {
                continue;
            };
            if frame.pinned {
                continue;
            }
            let FrameOwner { upage, dir, .. } = &frame.owner;
            if dir.is_accessed(*upage) {
                dir.set_accessed(*upage, false);
                continue;
            }
            return Some(frame.kva);
        }
        None
    }

    /// Frames owned by `dir`, for consistency checks.
    pub fn frames_of(&self, dir: &PageDirectory) -> Vec<(Kva, Va)> {
        self.arena
            .iter()
            .flatten()
            .filter(|frame| frame.owner.dir == *dir)
            .map(|frame| (frame.kva, frame.owner.upage))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel::addressing::{PAGE_SIZE, PHYS_BASE};

    struct Fixture {
        table: FrameTable,
        dir: PageDirectory,
        spt: Arc<SpinLock<SupplementalPageTable>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                table: FrameTable::new(),
                dir: PageDirectory::new(),
                spt: Arc::default(),
            }
        }

        fn add(&mut self, n: usize) -> (Kva, Va) {
            let kva = Kva::new(PHYS_BASE + n * PAGE_SIZE).unwrap();
            let upage = Va::new(0x1000_0000 + n * PAGE_SIZE).unwrap();
            assert!(self.dir.set_page(upage, kva, true));
            self.table.insert(Frame {
                kva,
                owner: FrameOwner {
                    upage,
                    dir: self.dir.clone(),
                    spt: self.spt.clone(),
                },
                pinned: false,
            });
            (kva, upage)
        }
    }

    #[test]
    fn clock_gives_a_second_chance() {
        let mut f = Fixture::new();
        let (k0, u0) = f.add(0);
        let (k1, _) = f.add(1);
        f.dir.set_accessed(u0, true);
        assert_eq!(f.table.pick_victim(), Some(k1));
        assert!(!f.dir.is_accessed(u0));
        // The hand moved on; the next victim is the frame that lost its bit.
        assert_eq!(f.table.pick_victim(), Some(k0));
    }

    #[test]
    fn pinned_frames_are_never_chosen() {
        let mut f = Fixture::new();
        let (k0, _) = f.add(0);
        let (k1, u1) = f.add(1);
        f.table.pin(k0);
        f.dir.set_accessed(u1, true);
        assert_eq!(f.table.pick_victim(), Some(k1));
        f.table.pin(k1);
        assert_eq!(f.table.pick_victim(), None);
        f.table.unpin(k0);
        assert_eq!(f.table.pick_victim(), Some(k0));
    }

    #[test]
    fn map_and_ring_stay_consistent() {
        let mut f = Fixture::new();
        let frames: Vec<_> = (0..4).map(|n| f.add(n)).collect();
        assert!(f.table.remove(frames[1].0).is_some());
        assert!(f.table.remove(frames[1].0).is_none());
        assert_eq!(f.table.len(), 3);
        assert_eq!(f.table.frames_of(&f.dir).len(), 3);

        // Slots are reused.
        let (k, _) = f.add(7);
        assert_eq!(f.table.get(k).map(|frame| frame.kva), Some(k));
        for _ in 0..8 {
            let victim = f.table.pick_victim().unwrap();
            assert!(f.table.get(victim).is_some());
        }
        for (kva, _) in frames.iter().filter(|(kva, _)| *kva != frames[1].0) {
            f.table.remove(*kva).unwrap();
        }
        f.table.remove(k).unwrap();
        assert!(f.table.is_empty());
        assert_eq!(f.table.pick_victim(), None);
    }
}
