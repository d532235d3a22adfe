//! Parsing of 32-bit x86 ELF executables.
//!
//! The Executable and Linkable Format starts with a fixed-size header that
//! locates a table of program headers. Each program header describes a
//! segment: where its bytes live in the file, where they go in memory and
//! with which permissions. Only the program headers matter for loading.
//!
//! Fields are decoded from their little-endian encoding, so a header read
//! from a file never has to be reinterpreted in place.
use keel::{KernelError, fs::File};
use num_enum::TryFromPrimitive;

/// `0x7f 'E' 'L' 'F'`, 32-bit class, little-endian, version 1.
pub const ELF_IDENT: [u8; 7] = *b"\x7fELF\x01\x01\x01";
/// `e_type` of an executable file.
pub const ET_EXEC: u16 = 2;
/// `e_machine` of the Intel 80386.
pub const EM_386: u16 = 3;
/// Size of an encoded ELF header.
pub const EHDR_SIZE: usize = 52;
/// Size of an encoded program header.
pub const PHDR_SIZE: usize = 32;
/// Largest program header table accepted.
pub const PHNUM_MAX: u16 = 1024;

fn u16_at(raw: &[u8], ofs: usize) -> u16 {
    u16::from_le_bytes([raw[ofs], raw[ofs + 1]])
}

fn u32_at(raw: &[u8], ofs: usize) -> u32 {
    u32::from_le_bytes([raw[ofs], raw[ofs + 1], raw[ofs + 2], raw[ofs + 3]])
}

/// The ELF file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ELFHeader {
    pub ident: [u8; 16],
    /// Object file type.
    pub e_type: u16,
    /// Target instruction set architecture.
    pub e_machine: u16,
    pub e_version: u32,
    /// Address of the entry point.
    pub e_entry: u32,
    /// File offset of the program header table.
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    /// Size of one program header table entry.
    pub e_phentsize: u16,
    /// Number of program header table entries.
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl ELFHeader {
    pub fn decode(raw: &[u8; EHDR_SIZE]) -> Self {
        let mut ident = [0; 16];
        ident.copy_from_slice(&raw[..16]);
        Self {
            ident,
            e_type: u16_at(raw, 16),
            e_machine: u16_at(raw, 18),
            e_version: u32_at(raw, 20),
            e_entry: u32_at(raw, 24),
            e_phoff: u32_at(raw, 28),
            e_shoff: u32_at(raw, 32),
            e_flags: u32_at(raw, 36),
            e_ehsize: u16_at(raw, 40),
            e_phentsize: u16_at(raw, 42),
            e_phnum: u16_at(raw, 44),
            e_shentsize: u16_at(raw, 46),
            e_shnum: u16_at(raw, 48),
            e_shstrndx: u16_at(raw, 50),
        }
    }

    pub fn encode(&self) -> [u8; EHDR_SIZE] {
        let mut raw = [0; EHDR_SIZE];
        raw[..16].copy_from_slice(&self.ident);
        raw[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        raw[18..20].copy_from_slice(&self.e_machine.to_le_bytes());
        raw[20..24].copy_from_slice(&self.e_version.to_le_bytes());
        raw[24..28].copy_from_slice(&self.e_entry.to_le_bytes());
        raw[28..32].copy_from_slice(&self.e_phoff.to_le_bytes());
        raw[32..36].copy_from_slice(&self.e_shoff.to_le_bytes());
        raw[36..40].copy_from_slice(&self.e_flags.to_le_bytes());
        raw[40..42].copy_from_slice(&self.e_ehsize.to_le_bytes());
        raw[42..44].copy_from_slice(&self.e_phentsize.to_le_bytes());
        raw[44..46].copy_from_slice(&self.e_phnum.to_le_bytes());
        raw[46..48].copy_from_slice(&self.e_shentsize.to_le_bytes());
        raw[48..50].copy_from_slice(&self.e_shnum.to_le_bytes());
        raw[50..52].copy_from_slice(&self.e_shstrndx.to_le_bytes());
        raw
    }

    /// Whether this is an i386 executable the loader understands.
    pub fn is_valid(&self) -> bool {
        self.ident[..7] == ELF_IDENT
            && self.e_type == ET_EXEC
            && self.e_machine == EM_386
            && self.e_version == 1
            && self.e_phentsize as usize == PHDR_SIZE
            && self.e_phnum <= PHNUM_MAX
    }
}

/// An executable opened for loading.
pub struct Elf<'a> {
    pub header: ELFHeader,
    pub file: &'a File,
}

impl<'a> Elf<'a> {
    /// Reads and checks the header of `file`.
    ///
    /// # Errors
    /// [`KernelError::NoExec`] if the file is too short or is not an i386
    /// executable.
    pub fn from_file(file: &'a File) -> Result<Self, KernelError> {
        let mut raw = [0; EHDR_SIZE];
        if file.read_at(&mut raw, 0) != EHDR_SIZE {
            return Err(KernelError::NoExec);
        }
        let header = ELFHeader::decode(&raw);
        if !header.is_valid() {
            return Err(KernelError::NoExec);
        }
        Ok(Self { header, file })
    }

    /// Returns an iterator over the program headers.
    pub fn phdrs(&self) -> PhdrIterator<'_, 'a> {
        PhdrIterator {
            cursor: 0,
            elf: self,
        }
    }
}

/// Iterator over the program headers of an [`Elf`].
///
/// Yields an error for a header that lies outside of the file.
pub struct PhdrIterator<'a, 'b> {
    cursor: u16,
    elf: &'a Elf<'b>,
}

impl Iterator for PhdrIterator<'_, '_> {
    type Item = Result<Phdr, KernelError>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = &self.elf.header;
        if self.cursor >= header.e_phnum {
            return None;
        }
        let ofs = header.e_phoff as usize + self.cursor as usize * PHDR_SIZE;
        self.cursor += 1;
        let mut raw = [0; PHDR_SIZE];
        if self.elf.file.read_at(&mut raw, ofs) != PHDR_SIZE {
            return Some(Err(KernelError::NoExec));
        }
        Some(Ok(Phdr::decode(&raw)))
    }
}

/// ELF program header type.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
pub enum PType {
    /// Unused entry.
    Null = 0x0,
    /// Loadable segment.
    Load = 0x1,
    /// Dynamic linking information.
    Dynamic = 0x2,
    /// Path of the program interpreter.
    Interp = 0x3,
    Note = 0x4,
    /// Reserved.
    Shlib = 0x5,
    /// The program header table itself.
    Phdr = 0x6,
    /// GNU-specific: Stack segment flags.
    GnuStack = 0x6474e551,
}

bitflags::bitflags! {
    /// Segment permission flags for ELF program headers.
    pub struct PFlags: u32 {
        const READ = 1 << 2;
        const WRITE = 1 << 1;
        const EXECUTABLE = 1 << 0;
    }
}

/// A 32-bit program header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Phdr {
    /// Raw segment type; see [`Phdr::ptype`].
    pub p_type: u32,
    /// Offset in the file where the segment starts.
    pub p_offset: u32,
    /// Virtual address of the segment.
    pub p_vaddr: u32,
    pub p_paddr: u32,
    /// Bytes of the segment stored in the file.
    pub p_filesz: u32,
    /// Bytes of the segment in memory; the excess over `p_filesz` is zeroed.
    pub p_memsz: u32,
    pub p_flags: PFlags,
    pub p_align: u32,
}

impl Phdr {
    pub fn decode(raw: &[u8; PHDR_SIZE]) -> Self {
        Self {
            p_type: u32_at(raw, 0),
            p_offset: u32_at(raw, 4),
            p_vaddr: u32_at(raw, 8),
            p_paddr: u32_at(raw, 12),
            p_filesz: u32_at(raw, 16),
            p_memsz: u32_at(raw, 20),
            p_flags: PFlags::from_bits_truncate(u32_at(raw, 24)),
            p_align: u32_at(raw, 28),
        }
    }

    pub fn encode(&self) -> [u8; PHDR_SIZE] {
        let mut raw = [0; PHDR_SIZE];
        for (i, word) in [
            self.p_type,
            self.p_offset,
            self.p_vaddr,
            self.p_paddr,
            self.p_filesz,
            self.p_memsz,
            self.p_flags.bits(),
            self.p_align,
        ]
        .into_iter()
        .enumerate()
        {
            raw[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        raw
    }

    /// The segment type, if it is one the loader knows.
    pub fn ptype(&self) -> Option<PType> {
        PType::try_from(self.p_type).ok()
    }

    pub fn is_writable(&self) -> bool {
        self.p_flags.contains(PFlags::WRITE)
    }
}

/// Assembles executable images, for installing programs into the file
/// system.
///
/// Each segment's bytes are placed at a file offset congruent to its virtual
/// address modulo the page size, after the headers.
pub struct ElfBuilder {
    header: ELFHeader,
    phdrs: Vec<(Phdr, Vec<u8>)>,
}

impl ElfBuilder {
    pub fn new(entry: u32) -> Self {
        let mut ident = [0; 16];
        ident[..7].copy_from_slice(&ELF_IDENT);
        Self {
            header: ELFHeader {
                ident,
                e_type: ET_EXEC,
                e_machine: EM_386,
                e_version: 1,
                e_entry: entry,
                e_phoff: EHDR_SIZE as u32,
                e_shoff: 0,
                e_flags: 0,
                e_ehsize: EHDR_SIZE as u16,
                e_phentsize: PHDR_SIZE as u16,
                e_phnum: 0,
                e_shentsize: 0,
                e_shnum: 0,
                e_shstrndx: 0,
            },
            phdrs: Vec::new(),
        }
    }

    /// The image every installed program gets: a read-only text segment and
    /// a writable data segment followed by bss.
    pub fn program() -> Self {
        Self::new(0x0804_8000)
            .segment(0x0804_8000, vec![0xcc; 0x180], 0x180, PFlags::READ | PFlags::EXECUTABLE)
            .segment(0x0804_a000, vec![0x5a; 0x20], 0x2000, PFlags::READ | PFlags::WRITE)
    }

    /// Adds a loadable segment holding `data` at `vaddr`, `memsz` bytes long
    /// in memory.
    pub fn segment(mut self, vaddr: u32, data: Vec<u8>, memsz: u32, flags: PFlags) -> Self {
        let phdr = Phdr {
            p_type: PType::Load as u32,
            p_offset: 0,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: data.len() as u32,
            p_memsz: memsz,
            p_flags: flags,
            p_align: 0x1000,
        };
        self.phdrs.push((phdr, data));
        self
    }

    /// Adds a program header with no contents.
    pub fn phdr(mut self, p_type: u32) -> Self {
        let phdr = Phdr {
            p_type,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: 0,
            p_memsz: 0,
            p_flags: PFlags::READ,
            p_align: 0,
        };
        self.phdrs.push((phdr, Vec::new()));
        self
    }

    /// Replaces the file header, for producing malformed images.
    pub fn with_header(mut self, f: impl FnOnce(&mut ELFHeader)) -> Self {
        f(&mut self.header);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut header = self.header;
        if header.e_phnum == 0 {
            header.e_phnum = self.phdrs.len() as u16;
        }
        let mut image = header.encode().to_vec();
        image.resize(header.e_phoff as usize, 0);
        let table_end = header.e_phoff as usize + self.phdrs.len() * PHDR_SIZE;

        let mut cursor = table_end;
        let mut placed = Vec::with_capacity(self.phdrs.len());
        for (mut phdr, data) in self.phdrs {
            if !data.is_empty() {
                let page = (cursor + 0xfff) & !0xfff;
                let ofs = page + (phdr.p_vaddr as usize & 0xfff);
                phdr.p_offset = ofs as u32;
                cursor = ofs + data.len();
            }
            placed.push((phdr, data));
        }
        for (phdr, _) in &placed {
            image.extend_from_slice(&phdr.encode());
        }
        for (phdr, data) in &placed {
            if !data.is_empty() {
                image.resize(phdr.p_offset as usize, 0);
                image.extend_from_slice(data);
            }
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_survive_encoding() {
        let image = ElfBuilder::program().build();
        let mut raw = [0; EHDR_SIZE];
        raw.copy_from_slice(&image[..EHDR_SIZE]);
        let header = ELFHeader::decode(&raw);
        assert!(header.is_valid());
        assert_eq!(header.e_entry, 0x0804_8000);
        assert_eq!(header.e_phnum, 2);

        let mut raw = [0; PHDR_SIZE];
        raw.copy_from_slice(&image[EHDR_SIZE + PHDR_SIZE..EHDR_SIZE + 2 * PHDR_SIZE]);
        let data = Phdr::decode(&raw);
        assert_eq!(data.ptype(), Some(PType::Load));
        assert_eq!(data.p_vaddr, 0x0804_a000);
        assert_eq!(data.p_offset as usize % 0x1000, 0);
        assert_eq!((data.p_filesz, data.p_memsz), (0x20, 0x2000));
        assert!(data.is_writable());
        assert_eq!(image[data.p_offset as usize], 0x5a);
    }

    #[test]
    fn foreign_images_are_not_valid() {
        let image = ElfBuilder::program()
            .with_header(|h| h.e_machine = 0x3e)
            .build();
        let mut raw = [0; EHDR_SIZE];
        raw.copy_from_slice(&image[..EHDR_SIZE]);
        assert!(!ELFHeader::decode(&raw).is_valid());

        let mut header = ELFHeader::decode(&raw);
        header.e_machine = EM_386;
        assert!(header.is_valid());
        header.ident[4] = 2;
        assert!(!header.is_valid());
    }

    #[test]
    fn unknown_segment_types_are_kept_raw() {
        let phdr = Phdr::decode(&{
            let mut raw = [0; PHDR_SIZE];
            raw[..4].copy_from_slice(&0x7000_0001u32.to_le_bytes());
            raw
        });
        assert_eq!(phdr.p_type, 0x7000_0001);
        assert_eq!(phdr.ptype(), None);
    }
}
