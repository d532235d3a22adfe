//! # System call abi for i386.
//!
//! A user program requests a service from the kernel by pushing the system
//! call number and its arguments on its stack, one 32-bit word each, and
//! trapping into the kernel with the stack pointer pointing at the number:
//!
//! | Address    | Contents        |
//! | ---------- | --------------- |
//! | `esp + 12` | third argument  |
//! | `esp + 8`  | second argument |
//! | `esp + 4`  | first argument  |
//! | `esp`      | syscall number  |
//!
//! The return value goes to `eax`.
//!
//! Every word is read through the address space of the process and validated
//! on the way: the stack pointer is as untrusted as any other pointer the
//! program hands over, and only the words a call actually uses are read.

use crate::uaccess::UserPtrRO;
use keel::{KernelError, addressing::Va};
use keel_vm::MmStruct;
use num_enum::TryFromPrimitive;

/// The register state of a user program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registers {
    /// Instruction pointer.
    pub eip: u32,
    /// Stack pointer.
    pub esp: Va,
    /// Return value of the last system call.
    pub eax: u32,
}

impl Registers {
    pub fn new(entry: u32) -> Self {
        Self {
            eip: entry,
            esp: Va::NULL,
            eax: 0,
        }
    }
}

/// System call numbers.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum SyscallNumber {
    /// Powers the machine off.
    Halt = 0,
    /// Terminates the process.
    Exit = 1,
    /// Starts a new process.
    Exec = 2,
    /// Waits for a child process.
    Wait = 3,
    Create = 4,
    Remove = 5,
    Open = 6,
    Filesize = 7,
    Read = 8,
    Write = 9,
    Seek = 10,
    Tell = 11,
    Close = 12,
    /// Maps a file into memory.
    Mmap = 13,
    /// Removes a mapping.
    Munmap = 14,
}

/// A system call request, decoded from the user stack.
pub struct SyscallAbi<'a> {
    /// The raw system call number.
    pub sysno: u32,
    esp: Va,
    mm: &'a MmStruct,
}

impl<'a> SyscallAbi<'a> {
    /// Reads the system call number at `esp`.
    ///
    /// # Errors
    /// [`KernelError::BadAddress`] if the word at `esp` is not readable.
    pub fn from_stack(mm: &'a MmStruct, esp: Va) -> Result<Self, KernelError> {
        let sysno = UserPtrRO::<u32>::new(esp).get(mm)?;
        Ok(Self { sysno, esp, mm })
    }

    /// The decoded system call number.
    pub fn number(&self) -> Result<SyscallNumber, KernelError> {
        SyscallNumber::try_from(self.sysno).map_err(|_| KernelError::NoSuchSyscall)
    }

    /// Reads the `n`-th argument word, counting from zero.
    pub fn arg(&self, n: usize) -> Result<u32, KernelError> {
        let addr = self
            .esp
            .checked_add(4 * (n + 1))
            .ok_or(KernelError::BadAddress)?;
        UserPtrRO::<u32>::new(addr).get(self.mm)
    }

    /// Reads the `n`-th argument as a signed word.
    pub fn arg_i32(&self, n: usize) -> Result<i32, KernelError> {
        self.arg(n).map(|w| w as i32)
    }

    /// Reads the `n`-th argument as a user address.
    pub fn arg_va(&self, n: usize) -> Result<Va, KernelError> {
        self.arg(n)
            .and_then(|w| Va::new(w as usize).ok_or(KernelError::BadAddress))
    }
}

/// Whether `e` terminates the calling process instead of being returned to
/// it as `-1`.
pub fn is_fatal(e: KernelError) -> bool {
    matches!(
        e,
        KernelError::BadAddress
            | KernelError::InvalidAccess
            | KernelError::BadFileDescriptor
            | KernelError::NoSuchSyscall
            | KernelError::NoSuchMapping
    )
}
