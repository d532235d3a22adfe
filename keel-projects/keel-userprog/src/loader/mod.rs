//! ## Program loading.
//!
//! Loading a program builds a fresh address space from an executable and a
//! command line, without copying a single byte of the program: each page of
//! each loadable segment is only registered in the supplemental page table,
//! to be read from the executable when the program first touches it.
//!
//! A segment is accepted only if
//! - its file offset and virtual address share the same page offset,
//! - it starts within the file, and `p_memsz` is non-zero and at least
//!   `p_filesz`,
//! - it lies in user memory, above the first page, without wrapping.
//!
//! Dynamically linked executables (`PT_DYNAMIC`, `PT_INTERP`, `PT_SHLIB`) are
//! rejected; other non-loadable headers are ignored.
//!
//! ## State on Program Startup
//!
//! The stack is one page right below `PHYS_BASE`, loaded eagerly, that
//! carries the arguments following the i386 calling convention.
//!
//! **Example command:** `/bin/ls -l foo bar`
//!
//! | Address    | Name           | Data       | Type        |
//! | ---------- | -------------- | ---------- | ----------- |
//! | 0xbffffffc | argv\[3\]\[...\]   | 'bar\0'    | char\[4\]     |
//! | 0xbffffff8 | argv\[2\]\[...\]   | 'foo\0'    | char\[4\]     |
//! | 0xbffffff5 | argv\[1\]\[...\]   | '-l\0'     | char\[3\]     |
//! | 0xbfffffed | argv\[0\]\[...\]   | '/bin/ls\0'| char\[8\]     |
//! | 0xbfffffec | word-align     | 0          | uint8_t     |
//! | 0xbfffffe8 | argv\[4\]        | 0          | char *      |
//! | 0xbfffffe4 | argv\[3\]        | 0xbffffffc | char *      |
//! | 0xbfffffe0 | argv\[2\]        | 0xbffffff8 | char *      |
//! | 0xbfffffdc | argv\[1\]        | 0xbffffff5 | char *      |
//! | 0xbfffffd8 | argv\[0\]        | 0xbfffffed | char *      |
//! | 0xbfffffd4 | argv           | 0xbfffffd8 | char **     |
//! | 0xbfffffd0 | argc           | 4          | int         |
//! | 0xbfffffcc | return address | 0          | void (*) () |
//!
//! The stack pointer starts at `0xbfffffcc`. A command line that does not
//! fit on the stack page fails the load.

pub mod elf;
pub mod stack_builder;

use crate::syscall::Registers;
use arrayvec::ArrayVec;
use elf::{Elf, ElfBuilder, PType, Phdr};
use keel::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SIZE, PHYS_BASE, Va},
    fs::{File, FileSystem},
};
use keel_vm::MmStruct;
use stack_builder::StackBuilder;
use std::sync::Arc;

/// Most arguments a stack page could ever hold pointers for.
pub const MAX_ARGS: usize = PAGE_SIZE / 4;

/// A context that holds the state of a program being loaded: its address
/// space and its initial registers.
pub struct LoadContext {
    pub mm_struct: MmStruct,
    pub regs: Registers,
}

impl LoadContext {
    /// Checks that `phdr` describes a segment that can be loaded.
    fn validate_segment(phdr: &Phdr, file_len: usize) -> Result<(), KernelError> {
        let offset = phdr.p_offset as usize;
        let vaddr = phdr.p_vaddr as usize;
        let memsz = phdr.p_memsz as usize;
        let ok = offset & PAGE_MASK == vaddr & PAGE_MASK
            && offset <= file_len
            && phdr.p_memsz >= phdr.p_filesz
            && memsz != 0
            && vaddr < PHYS_BASE
            && vaddr.checked_add(memsz).is_some_and(|end| end < PHYS_BASE)
            && vaddr >= PAGE_SIZE;
        if ok {
            Ok(())
        } else {
            log::debug!("load: rejected segment {phdr:?}");
            Err(KernelError::NoExec)
        }
    }

    /// Registers every page of the loadable segment `phdr`.
    ///
    /// The page holding the segment's first byte also holds the bytes of the
    /// file that precede it on that page, so reading starts at the file
    /// offset rounded down to a page.
    fn load_segment(&mut self, image: &Arc<File>, phdr: &Phdr) -> Result<(), KernelError> {
        let vaddr = phdr.p_vaddr as usize;
        let page_offset = vaddr & PAGE_MASK;
        let memsz = phdr.p_memsz as usize;
        let filesz = phdr.p_filesz as usize;
        let total = (page_offset + memsz).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut read_bytes = if filesz > 0 { page_offset + filesz } else { 0 };

        let mut upage = Va::new(vaddr & !PAGE_MASK).ok_or(KernelError::NoExec)?;
        let mut offset = phdr.p_offset as usize & !PAGE_MASK;
        for _ in 0..total / PAGE_SIZE {
            let page_read = read_bytes.min(PAGE_SIZE);
            self.mm_struct
                .map_segment_page(upage, image, offset, page_read, phdr.is_writable())?;
            read_bytes -= page_read;
            offset += page_read;
            upage += PAGE_SIZE;
        }
        Ok(())
    }

    /// Registers the loadable segments of `elf`.
    pub fn load_phdr(&mut self, elf: &Elf, image: &Arc<File>) -> Result<(), KernelError> {
        let file_len = image.length();
        for phdr in elf.phdrs() {
            let phdr = phdr?;
            match phdr.ptype() {
                Some(PType::Dynamic | PType::Interp | PType::Shlib) => {
                    log::debug!("load: dynamic executables are not supported");
                    return Err(KernelError::NoExec);
                }
                Some(PType::Load) => {
                    Self::validate_segment(&phdr, file_len)?;
                    self.load_segment(image, &phdr)?;
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Builds the stack page and pushes `arguments` on it.
    ///
    /// # Errors
    /// [`KernelError::NoMemory`] if the arguments do not fit on the page.
    pub fn build_stack(&mut self, arguments: &[&str]) -> Result<(), KernelError> {
        let Self {
            mm_struct: mm_state,
            regs,
        } = self;
        let mut builder = StackBuilder::new(mm_state)?;
        let mut argv: ArrayVec<Va, MAX_ARGS> = ArrayVec::new();
        for arg in arguments.iter().rev() {
            let va = builder.push_str(arg)?;
            argv.try_push(va).map_err(|_| KernelError::NoMemory)?;
        }
        builder.align(4)?;
        builder.push_u32(0)?;
        for va in &argv {
            builder.push_u32(va.into_usize() as u32)?;
        }
        let argv_va = builder.sp();
        builder.push_u32(argv_va.into_usize() as u32)?;
        builder.push_u32(arguments.len() as u32)?;
        builder.push_u32(0)?;
        regs.esp = builder.finish();
        Ok(())
    }

    /// Loads the executable `image` into the fresh address space `mm_struct`,
    /// with `args` as its command line.
    pub fn load(mm_struct: MmStruct, image: &Arc<File>, args: &[&str]) -> Result<Self, KernelError> {
        let elf = Elf::from_file(image)?;
        let mut this = Self {
            mm_struct,
            regs: Registers::new(elf.header.e_entry),
        };
        let loaded = this
            .load_phdr(&elf, image)
            .and_then(|_| this.build_stack(args));
        match loaded {
            Ok(()) => Ok(this),
            Err(e) => {
                this.mm_struct.destroy();
                Err(e)
            }
        }
    }
}

/// Installs the standard program image under `name`.
pub fn install_executable(fs: &FileSystem, name: &str) -> Result<(), KernelError> {
    fs.install(name, &ElfBuilder::program().build())
}
