//! Memory-mapped file registry.
//!
//! Each successful `mmap` is recorded as a [`MemoryFile`] under a map id that
//! is unique within the process. Ids are handed out in increasing order and
//! never reused.

use keel::{
    addressing::{PAGE_SIZE, Va},
    fs::File,
};
use std::{collections::BTreeMap, ops::Range, sync::Arc};

/// Identifies a mapping within a process.
pub type MapId = usize;

/// An active file mapping.
pub struct MemoryFile {
    pub id: MapId,
    /// Handle the mapping reads and writes through. Independent of any file
    /// descriptor of the process.
    pub file: Arc<File>,
    pub start: Va,
    /// Number of mapped pages.
    pub pages: usize,
}

impl MemoryFile {
    /// Mapped address range.
    pub fn range(&self) -> Range<Va> {
        self.start..self.start + self.pages * PAGE_SIZE
    }

    /// The mapped pages, with their offsets in the file.
    pub fn pages(&self) -> impl Iterator<Item = (Va, usize)> + '_ {
        (0..self.pages).map(|i| (self.start + i * PAGE_SIZE, i * PAGE_SIZE))
    }
}

#[derive(Default)]
pub struct MmapRegistry {
    next_id: MapId,
    maps: BTreeMap<MapId, MemoryFile>,
}

impl MmapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a mapping and returns its id.
    pub fn insert(&mut self, file: Arc<File>, start: Va, pages: usize) -> MapId {
        let id = self.next_id;
        self.next_id += 1;
        self.maps.insert(
            id,
            MemoryFile {
                id,
                file,
                start,
                pages,
            },
        );
        id
    }

    pub fn remove(&mut self, id: MapId) -> Option<MemoryFile> {
        self.maps.remove(&id)
    }

    /// Removes the mapping with the lowest id.
    pub fn pop_first(&mut self) -> Option<MemoryFile> {
        self.maps.pop_first().map(|(_, map)| map)
    }

    pub fn get(&self, id: MapId) -> Option<&MemoryFile> {
        self.maps.get(&id)
    }

    /// Ids of every active mapping, in increasing order.
    pub fn ids(&self) -> Vec<MapId> {
        self.maps.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
