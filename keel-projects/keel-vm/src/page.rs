//! Supplemental page table.
//!
//! The hardware page directory only knows about pages that are resident. The
//! supplemental page table (SPT) of an address space describes every user page
//! the process may legally touch, resident or not, and how to populate it on
//! the first access:
//!
//! - [`Backing::Zero`] pages are filled with zeroes.
//! - [`Backing::File`] pages read `read_bytes` bytes of a file at `offset`
//!   and zero the rest of the page.
//!
//! An entry that records a [`SwapSlot`] is populated from swap instead: its
//! content was modified and later evicted.
//!
//! There is at most one entry per page. Adding an entry for a page that
//! already has one hands the new entry back, and the caller decides whether
//! that is an error or an overlap to merge.

use crate::swap::SwapSlot;
use keel::{
    addressing::{PAGE_SIZE, Va},
    fs::File,
};
use std::{collections::HashMap, sync::Arc};

/// How a page is populated when it is first touched.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled.
    Zero,
    /// Read from a file.
    File(FileBacking),
}

/// File contents of a page.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<File>,
    /// Offset of the page's contents in `file`.
    pub offset: usize,
    /// Bytes read from the file. The rest of the page is zeroed.
    pub read_bytes: usize,
    /// Whether modifications go back to the file. Set for memory-mapped
    /// files; modified pages of an executable go to swap instead.
    pub write_back: bool,
}

/// A supplemental page table entry.
#[derive(Clone)]
pub struct SptEntry {
    /// The page this entry describes.
    pub upage: Va,
    pub backing: Backing,
    pub writable: bool,
    /// Where the page lives while it is swapped out.
    pub swap_slot: Option<SwapSlot>,
}

impl SptEntry {
    /// An entry for a zero-filled page.
    pub fn zero(upage: Va, writable: bool) -> Self {
        debug_assert_eq!(upage.offset(), 0);
        Self {
            upage,
            backing: Backing::Zero,
            writable,
            swap_slot: None,
        }
    }

    /// An entry for a page read from `file`.
    pub fn file(
        upage: Va,
        file: Arc<File>,
        offset: usize,
        read_bytes: usize,
        writable: bool,
        write_back: bool,
    ) -> Self {
        debug_assert_eq!(upage.offset(), 0);
        assert!(read_bytes <= PAGE_SIZE, "Page reads {read_bytes} bytes.");
        Self {
            upage,
            backing: Backing::File(FileBacking {
                file,
                offset,
                read_bytes,
                write_back,
            }),
            writable,
            swap_slot: None,
        }
    }

    /// The file this page is written back to when it is modified.
    pub fn write_back(&self) -> Option<&FileBacking> {
        match &self.backing {
            Backing::File(backing) if backing.write_back => Some(backing),
            _ => None,
        }
    }
}

/// Map from user page to [`SptEntry`].
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: HashMap<Va, SptEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entry`.
    ///
    /// If the page already has an entry, the table is left unchanged and
    /// `entry` is handed back.
    pub fn add_page(&mut self, entry: SptEntry) -> Result<(), SptEntry> {
        if self.entries.contains_key(&entry.upage) {
            return Err(entry);
        }
        self.entries.insert(entry.upage, entry);
        Ok(())
    }

    /// Entry of the page that contains `addr`.
    pub fn find_addr(&self, addr: Va) -> Option<&SptEntry> {
        self.entries.get(&addr.page_down())
    }

    pub fn find_addr_mut(&mut self, addr: Va) -> Option<&mut SptEntry> {
        self.entries.get_mut(&addr.page_down())
    }

    /// Removes the entry of the page that contains `addr`.
    pub fn delete_page(&mut self, addr: Va) -> Option<SptEntry> {
        self.entries.remove(&addr.page_down())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pages that have an entry, in no particular order.
    pub fn pages(&self) -> Vec<Va> {
        self.entries.keys().copied().collect()
    }
}
