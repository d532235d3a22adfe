//! # Memory state of a process
//!
//! [`MmStruct`] is the address space of one process: its hardware page
//! directory, its supplemental page table, and its memory-mapped files.
//!
//! Pages are registered lazily, either by the loader
//! ([`MmStruct::map_segment_page`], [`MmStruct::map_zero_page`]) or by
//! [`MmStruct::mmap`], and become resident through
//! [`MmStruct::handle_page_fault`].
//!
//! ## Validating user input
//!
//! The kernel must never crash because of a pointer a user program passes to
//! a system call. [`MmStruct::access_ok`] tells whether an address may be
//! touched: it is a user address that is either resident or has a
//! supplemental page table entry. [`MmStruct::read_user`] and
//! [`MmStruct::write_user`] copy through the page directory exactly like the
//! program itself would, faulting pages in on the way, and fail instead of
//! faulting on an address the program could not access.

use crate::{
    Vm,
    frame::FrameOwner,
    mmap::{MapId, MemoryFile, MmapRegistry},
    page::{Backing, FileBacking, SptEntry, SupplementalPageTable},
    pages_for,
};
use keel::{
    KernelError,
    addressing::{Kva, PAGE_SIZE, PHYS_BASE, Va},
    fs::File,
    paging::{PageDirectory, PageFault},
    spinlock::SpinLock,
};
use std::sync::Arc;

/// The address space of a process.
pub struct MmStruct {
    vm: Arc<Vm>,
    dir: PageDirectory,
    spt: Arc<SpinLock<SupplementalPageTable>>,
    mmaps: MmapRegistry,
}

impl MmStruct {
    /// Creates an empty address space.
    pub fn new(vm: Arc<Vm>) -> Self {
        Self {
            vm,
            dir: PageDirectory::new(),
            spt: Arc::default(),
            mmaps: MmapRegistry::new(),
        }
    }

    pub fn page_directory(&self) -> &PageDirectory {
        &self.dir
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    fn with_spt<R>(&self, f: impl FnOnce(&mut SupplementalPageTable) -> R) -> R {
        let mut spt = self.spt.lock();
        let r = f(&mut spt);
        spt.unlock();
        r
    }

    /// The supplemental page table entry of the page containing `addr`.
    pub fn find_page(&self, addr: Va) -> Option<SptEntry> {
        self.with_spt(|spt| spt.find_addr(addr).cloned())
    }

    /// Number of pages with a supplemental page table entry.
    pub fn registered_pages(&self) -> usize {
        self.with_spt(|spt| spt.len())
    }

    /// Registers a zero-filled page.
    pub fn map_zero_page(&self, upage: Va, writable: bool) -> Result<(), KernelError> {
        self.with_spt(|spt| spt.add_page(SptEntry::zero(upage, writable)))
            .map_err(|_| KernelError::InvalidArgument)
    }

    /// Registers a page of an executable segment.
    ///
    /// Segments may share a page. The page then stays writable if either
    /// segment is, and reads as many bytes as the larger of the two reads.
    pub fn map_segment_page(
        &self,
        upage: Va,
        file: &Arc<File>,
        offset: usize,
        read_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        let entry = SptEntry::file(upage, file.clone(), offset, read_bytes, writable, false);
        self.with_spt(|spt| {
            // Segments that share a page share its file page too, and read
            // lengths count from the page start, so the longer read covers both.
            if let Err(entry) = spt.add_page(entry) {
                let Some(existing) = spt.find_addr_mut(upage) else {
                    return;
                };
                existing.writable |= entry.writable;
                if let Backing::File(new) = entry.backing {
                    match &mut existing.backing {
                        Backing::File(old) => old.read_bytes = old.read_bytes.max(new.read_bytes),
                        backing => *backing = Backing::File(new),
                    }
                }
            }
        });
        Ok(())
    }

    /// Makes the page at `upage` resident.
    ///
    /// Obtains a frame (possibly evicting another page), maps it with the
    /// permission of the page's entry and fills it from swap or from its
    /// backing. Afterwards the page is clean and recently accessed, unless
    /// it came from swap: such a page is dirty so that a later eviction
    /// writes it to swap again.
    pub fn load_page(&self, upage: Va) -> Result<(), KernelError> {
        let upage = upage.page_down();
        let kva = self.vm.get_free_frame(FrameOwner {
            upage,
            dir: self.dir.clone(),
            spt: self.spt.clone(),
        })?;

        // Read the entry only once the frame is ours: an eviction of this
        // page that was in flight has recorded its swap slot by now.
        let entry = self.with_spt(|spt| {
            spt.find_addr_mut(upage).map(|entry| {
                let slot = entry.swap_slot.take();
                (entry.clone(), slot)
            })
        });
        let Some((entry, slot)) = entry else {
            self.vm.free_frame(kva);
            return Err(KernelError::BadAddress);
        };
        if !self.dir.set_page(upage, kva, entry.writable) {
            self.with_spt(|spt| {
                if let Some(entry) = spt.find_addr_mut(upage) {
                    entry.swap_slot = slot;
                }
            });
            self.vm.free_frame(kva);
            return Err(KernelError::BadAddress);
        }

        let memory = &self.vm.machine().memory;
        let populated = match (slot, &entry.backing) {
            (Some(slot), _) => {
                self.vm.swap().swap_in(slot, kva);
                Ok(true)
            }
            (None, Backing::Zero) => {
                memory.fill(kva, 0, PAGE_SIZE);
                Ok(false)
            }
            (None, Backing::File(FileBacking {
                file,
                offset,
                read_bytes,
                ..
            })) => {
                let mut buf = vec![0u8; PAGE_SIZE];
                let read = file.read_at(&mut buf[..*read_bytes], *offset);
                if read == *read_bytes {
                    memory.write(kva, &buf);
                    Ok(false)
                } else {
                    log::warn!("vm: short read of {read}/{read_bytes} bytes for {upage:?}");
                    Err(KernelError::IOError)
                }
            }
        };
        match populated {
            Ok(from_swap) => {
                self.dir.set_dirty(upage, from_swap);
                self.dir.set_accessed(upage, true);
                self.vm.unpin(kva);
                Ok(())
            }
            Err(e) => {
                self.dir.clear_page(upage);
                self.vm.free_frame(kva);
                Err(e)
            }
        }
    }

    /// Resolves a fault on `addr`.
    ///
    /// # Errors
    /// - [`KernelError::BadAddress`]: `addr` is not a user address, or no
    ///   page is registered there.
    /// - [`KernelError::InvalidAccess`]: a write to a read-only page.
    /// - [`KernelError::NoMemory`], [`KernelError::IOError`]: the page could
    ///   not be populated.
    pub fn handle_page_fault(&self, addr: Va, write: bool) -> Result<(), KernelError> {
        if !addr.is_user() {
            return Err(KernelError::BadAddress);
        }
        if self.dir.get_page(addr).is_some() {
            // Resident, so the access violated the page's permission.
            return Err(KernelError::InvalidAccess);
        }
        match self.find_page(addr) {
            None => Err(KernelError::BadAddress),
            Some(entry) if write && !entry.writable => Err(KernelError::InvalidAccess),
            Some(_) => self.load_page(addr),
        }
    }

    /// Whether the program may access `addr`.
    pub fn access_ok(&self, addr: Va, write: bool) -> bool {
        if addr.into_usize() == 0 || !addr.is_user() {
            return false;
        }
        if self.dir.get_page(addr).is_some() {
            return !write || self.dir.is_writable(addr.page_down());
        }
        self.find_page(addr)
            .is_some_and(|entry| !write || entry.writable)
    }

    /// Translates `addr` like the MMU, faulting the page in if needed.
    fn translate(&self, addr: Va, write: bool) -> Result<Kva, KernelError> {
        loop {
            match self.dir.translate(addr, write) {
                Ok(kva) => return Ok(kva),
                Err(PageFault::NotPresent(_)) => self.handle_page_fault(addr, write)?,
                Err(PageFault::WriteToReadOnly(_)) => return Err(KernelError::InvalidAccess),
                Err(PageFault::KernelAddress(_)) => return Err(KernelError::BadAddress),
            }
        }
    }

    /// Visits `[addr, addr + len)` page by page.
    fn for_each_chunk(
        &self,
        addr: Va,
        len: usize,
        write: bool,
        mut f: impl FnMut(Kva, usize, usize),
    ) -> Result<(), KernelError> {
        if addr.into_usize() == 0 {
            return Err(KernelError::BadAddress);
        }
        let end = addr.checked_add(len).ok_or(KernelError::BadAddress)?;
        if end.into_usize() > PHYS_BASE {
            return Err(KernelError::BadAddress);
        }
        let mut done = 0;
        while done < len {
            let va = addr + done;
            let chunk = (PAGE_SIZE - va.offset()).min(len - done);
            let kva = self.translate(va, write)?;
            f(kva, done, chunk);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `buf.len()` bytes of user memory at `addr` into `buf`.
    pub fn read_user(&self, addr: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let memory = &self.vm.machine().memory;
        self.for_each_chunk(addr, buf.len(), false, |kva, done, chunk| {
            memory.read(kva, &mut buf[done..done + chunk])
        })
    }

    /// Copies `data` into user memory at `addr`.
    pub fn write_user(&self, addr: Va, data: &[u8]) -> Result<(), KernelError> {
        let memory = &self.vm.machine().memory;
        self.for_each_chunk(addr, data.len(), true, |kva, done, chunk| {
            memory.write(kva, &data[done..done + chunk])
        })
    }

    /// Maps `file` at `addr`.
    ///
    /// Every page of the range `[addr, addr + length)` must be free: neither
    /// resident nor registered. On failure nothing stays registered.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] for an empty file, an address that
    /// is null, unaligned or outside user memory, or a range that overlaps
    /// existing pages.
    pub fn mmap(&mut self, file: File, addr: Va) -> Result<MapId, KernelError> {
        let length = file.length();
        if length == 0 || addr.into_usize() == 0 || addr.offset() != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pages = pages_for(length);
        let end = addr
            .checked_add(pages * PAGE_SIZE)
            .ok_or(KernelError::InvalidArgument)?;
        if end.into_usize() > PHYS_BASE {
            return Err(KernelError::InvalidArgument);
        }

        let file = Arc::new(file);
        let mut registered = Vec::with_capacity(pages);
        for i in 0..pages {
            let upage = addr + i * PAGE_SIZE;
            let offset = i * PAGE_SIZE;
            let entry = SptEntry::file(
                upage,
                file.clone(),
                offset,
                (length - offset).min(PAGE_SIZE),
                true,
                true,
            );
            let added = self.dir.get_page(upage).is_none()
                && self.with_spt(|spt| spt.add_page(entry).is_ok());
            if !added {
                log::debug!("mmap: {upage:?} is already in use");
                self.with_spt(|spt| {
                    for upage in registered.drain(..) {
                        spt.delete_page(upage);
                    }
                });
                return Err(KernelError::InvalidArgument);
            }
            registered.push(upage);
        }
        let id = self.mmaps.insert(file, addr, pages);
        log::debug!("mmap: id {id} at {addr:?}, {pages} pages");
        Ok(id)
    }

    /// Unmaps the mapping `id`, writing modified pages back to the file.
    pub fn munmap(&mut self, id: MapId) -> Result<(), KernelError> {
        let map = self.mmaps.remove(id).ok_or(KernelError::NoSuchMapping)?;
        self.unmap(&map);
        log::debug!("munmap: id {id}");
        Ok(())
    }

    /// Releases every page of `map`, writing modified ones back.
    fn unmap(&self, map: &MemoryFile) {
        for (upage, _) in map.pages() {
            let write_back = self
                .find_page(upage)
                .and_then(|entry| entry.write_back().cloned());
            self.release_page(upage, write_back.as_ref());
        }
    }

    /// Frees the frame or swap slot of `upage` and forgets it.
    fn release_page(&self, upage: Va, write_back: Option<&FileBacking>) {
        self.vm.unmap_page(&self.dir, upage, write_back);
        if let Some(slot) = self
            .with_spt(|spt| spt.delete_page(upage))
            .and_then(|entry| entry.swap_slot)
        {
            self.vm.swap().release(slot);
        }
    }

    /// Ids of the active mappings.
    pub fn mappings(&self) -> Vec<MapId> {
        self.mmaps.ids()
    }

    /// Tears the address space down: unmaps every mapping, then frees every
    /// page.
    ///
    /// The page directory must not be active anymore.
    pub fn destroy(mut self) {
        while let Some(map) = self.mmaps.pop_first() {
            self.unmap(&map);
        }
        let pages = self.with_spt(|spt| spt.pages());
        for upage in pages {
            self.release_page(upage, None);
        }
        self.dir.destroy();
    }
}
