//! Hardware page directory.
//!
//! A [`PageDirectory`] maps user pages to frames. Like real paging hardware,
//! [`PageDirectory::translate`] sets the accessed bit of every page it
//! translates and the dirty bit of every page it translates for a write, so
//! software can observe usage without being involved in each access.
//!
//! The handle is shared: the owning process and the frame table (when it
//! evicts a page of some other process) both operate on the same directory.

use crate::{
    addressing::{Kva, Va},
    spinlock::SpinLock,
};
use std::{collections::BTreeMap, sync::Arc};

bitflags::bitflags! {
    /// Flags of a page table entry.
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

/// A page table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub kva: Kva,
    pub flags: PteFlags,
}

/// Reason of a failed translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageFault {
    /// No present mapping for the page.
    NotPresent(Va),
    /// Write to a read-only page.
    WriteToReadOnly(Va),
    /// Access to kernel memory from user mode.
    KernelAddress(Va),
}

/// A user page directory.
#[derive(Clone)]
pub struct PageDirectory {
    entries: Arc<SpinLock<BTreeMap<Va, Pte>>>,
}

impl PartialEq for PageDirectory {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl Eq for PageDirectory {}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageDirectory({:p})", Arc::as_ptr(&self.entries))
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(SpinLock::new(BTreeMap::new())),
        }
    }

    fn with_entry<R>(&self, upage: Va, f: impl FnOnce(Option<&mut Pte>) -> R) -> R {
        let mut entries = self.entries.lock();
        let r = f(entries.get_mut(&upage.page_down()));
        entries.unlock();
        r
    }

    /// Maps `upage` to `kva`. Fails if `upage` is already mapped.
    pub fn set_page(&self, upage: Va, kva: Kva, writable: bool) -> bool {
        assert_eq!(upage.offset(), 0, "Mapping unaligned page {upage:?}");
        assert!(upage.is_user(), "Mapping kernel page {upage:?}");
        let mut entries = self.entries.lock();
        let installed = if entries.contains_key(&upage) {
            false
        } else {
            let mut flags = PteFlags::PRESENT | PteFlags::USER;
            flags.set(PteFlags::WRITABLE, writable);
            entries.insert(upage, Pte { kva, flags });
            true
        };
        entries.unlock();
        installed
    }

    /// Frame mapped at `uaddr`, including the offset within the page.
    pub fn get_page(&self, uaddr: Va) -> Option<Kva> {
        self.with_entry(uaddr, |pte| pte.map(|pte| pte.kva + uaddr.offset()))
    }

    /// Removes the mapping of `upage`.
    pub fn clear_page(&self, upage: Va) {
        let mut entries = self.entries.lock();
        entries.remove(&upage.page_down());
        entries.unlock();
    }

    pub fn is_writable(&self, upage: Va) -> bool {
        self.with_entry(upage, |pte| {
            pte.is_some_and(|pte| pte.flags.contains(PteFlags::WRITABLE))
        })
    }

    pub fn is_dirty(&self, upage: Va) -> bool {
        self.with_entry(upage, |pte| {
            pte.is_some_and(|pte| pte.flags.contains(PteFlags::DIRTY))
        })
    }

    pub fn set_dirty(&self, upage: Va, dirty: bool) {
        self.with_entry(upage, |pte| {
            if let Some(pte) = pte {
                pte.flags.set(PteFlags::DIRTY, dirty)
            }
        })
    }

    pub fn is_accessed(&self, upage: Va) -> bool {
        self.with_entry(upage, |pte| {
            pte.is_some_and(|pte| pte.flags.contains(PteFlags::ACCESSED))
        })
    }

    pub fn set_accessed(&self, upage: Va, accessed: bool) {
        self.with_entry(upage, |pte| {
            if let Some(pte) = pte {
                pte.flags.set(PteFlags::ACCESSED, accessed)
            }
        })
    }

    /// Walks the directory the way the MMU does for a user-mode access.
    pub fn translate(&self, va: Va, write: bool) -> Result<Kva, PageFault> {
        if !va.is_user() {
            return Err(PageFault::KernelAddress(va));
        }
        self.with_entry(va, |pte| match pte {
            None => Err(PageFault::NotPresent(va)),
            Some(pte) if write && !pte.flags.contains(PteFlags::WRITABLE) => {
                Err(PageFault::WriteToReadOnly(va))
            }
            Some(pte) => {
                pte.flags.insert(PteFlags::ACCESSED);
                if write {
                    pte.flags.insert(PteFlags::DIRTY);
                }
                Ok(pte.kva + va.offset())
            }
        })
    }

    /// Number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        let entries = self.entries.lock();
        let n = entries.len();
        entries.unlock();
        n
    }

    /// Drops every mapping. The frames themselves are not freed.
    pub fn destroy(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        entries.unlock();
    }
}
