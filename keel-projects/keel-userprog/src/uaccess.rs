//! Access to user memory from system call handlers.
//!
//! Every pointer a program passes to the kernel is untrusted. The types here
//! wrap such pointers; each is consumed by the single access it permits, and
//! every access goes through the [`MmStruct`] of the process, which faults
//! pages in like the program itself would and fails where the program would
//! have faulted:
//!
//! - [`UserPtrRO`] and [`UserPtrWO`] read or write one little-endian word.
//! - [`UserU8SliceRO`] and [`UserU8SliceWO`] read or write a byte buffer.
//! - [`UserCString`] reads a NUL-terminated string.
//!
//! A failed access yields [`KernelError::BadAddress`], or
//! [`KernelError::InvalidAccess`] for a write to a read-only page.
use keel::{
    KernelError,
    addressing::{PAGE_SIZE, PHYS_BASE, Va},
};
use keel_vm::MmStruct;
use std::marker::PhantomData;

/// A value that crosses the user boundary as little-endian bytes.
pub trait UserWord: Copy {
    const SIZE: usize;
    fn from_le_slice(bytes: &[u8]) -> Self;
    fn to_le_vec(self) -> Vec<u8>;
}

macro_rules! impl_user_word {
    ($($t: ty),*) => {
        $(
            impl UserWord for $t {
                const SIZE: usize = core::mem::size_of::<$t>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0; core::mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_le_bytes(raw)
                }

                fn to_le_vec(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )*
    };
}

impl_user_word!(u8, u32, i32);

/// A one-time, read-only pointer to a user-space object of type `T`.
#[derive(PartialEq, Eq, Debug)]
pub struct UserPtrRO<T: UserWord> {
    addr: Va,
    _ty: PhantomData<T>,
}

impl<T: UserWord> UserPtrRO<T> {
    pub fn new(addr: Va) -> Self {
        Self {
            addr,
            _ty: PhantomData,
        }
    }

    /// Reads the value.
    pub fn get(self, mm: &MmStruct) -> Result<T, KernelError> {
        let mut raw = vec![0; T::SIZE];
        mm.read_user(self.addr, &mut raw)?;
        Ok(T::from_le_slice(&raw))
    }
}

/// A one-time, write-only pointer to a user-space object of type `T`.
#[derive(PartialEq, Eq, Debug)]
pub struct UserPtrWO<T: UserWord> {
    addr: Va,
    _ty: PhantomData<T>,
}

impl<T: UserWord> UserPtrWO<T> {
    pub fn new(addr: Va) -> Self {
        Self {
            addr,
            _ty: PhantomData,
        }
    }

    /// Writes `value`, returning the number of bytes written.
    pub fn put(self, mm: &MmStruct, value: T) -> Result<usize, KernelError> {
        mm.write_user(self.addr, &value.to_le_vec())?;
        Ok(T::SIZE)
    }
}

/// Checks that every page of `[addr, addr + len)` may be accessed.
fn check_range(mm: &MmStruct, addr: Va, len: usize, write: bool) -> Result<(), KernelError> {
    let end = addr.checked_add(len).ok_or(KernelError::BadAddress)?;
    if end.into_usize() > PHYS_BASE {
        return Err(KernelError::BadAddress);
    }
    let mut page = addr;
    while page < end {
        if !mm.access_ok(page, write) {
            return Err(KernelError::BadAddress);
        }
        page = page.page_down() + PAGE_SIZE;
    }
    Ok(())
}

/// A one-time, read-only pointer to `len` bytes of user memory.
pub struct UserU8SliceRO {
    addr: Va,
    len: usize,
}

impl UserU8SliceRO {
    pub fn new(addr: Va, len: usize) -> Self {
        Self { addr, len }
    }

    /// Fails unless the whole buffer is readable by the program.
    pub fn check(&self, mm: &MmStruct) -> Result<(), KernelError> {
        check_range(mm, self.addr, self.len, false)
    }

    /// Copies the bytes into a kernel buffer.
    ///
    /// The range is checked before the buffer is allocated.
    pub fn get(self, mm: &MmStruct) -> Result<Vec<u8>, KernelError> {
        self.check(mm)?;
        let mut buf = vec![0; self.len];
        mm.read_user(self.addr, &mut buf)?;
        Ok(buf)
    }
}

/// A one-time, write-only pointer to `len` bytes of user memory.
pub struct UserU8SliceWO {
    addr: Va,
    len: usize,
}

impl UserU8SliceWO {
    pub fn new(addr: Va, len: usize) -> Self {
        Self { addr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fails unless the whole buffer is writable by the program.
    ///
    /// Handlers check the buffer before producing its contents, so that a
    /// bad buffer is reported before any side effect.
    pub fn check(&self, mm: &MmStruct) -> Result<(), KernelError> {
        check_range(mm, self.addr, self.len, true)
    }

    /// Copies `data`, at most `len` bytes of it, into the buffer. Returns
    /// the number of bytes written.
    pub fn put(self, mm: &MmStruct, data: &[u8]) -> Result<usize, KernelError> {
        let n = data.len().min(self.len);
        mm.write_user(self.addr, &data[..n])?;
        Ok(n)
    }
}

/// A NUL-terminated string in user memory.
pub struct UserCString {
    addr: Va,
}

impl UserCString {
    pub fn new(addr: Va) -> Self {
        Self { addr }
    }

    /// Reads the string, stopping at the NUL or after `max` bytes.
    ///
    /// # Errors
    /// - [`KernelError::BadAddress`] if the string runs into memory the
    ///   program cannot read.
    /// - [`KernelError::InvalidArgument`] if it is not valid UTF-8.
    pub fn read(self, mm: &MmStruct, max: usize) -> Result<String, KernelError> {
        let mut bytes = Vec::new();
        let mut addr = self.addr;
        // Reads stay within one page at a time, so nothing past the NUL is
        // touched.
        while bytes.len() < max {
            let chunk = (PAGE_SIZE - addr.offset()).min(max - bytes.len());
            let mut buf = vec![0; chunk];
            mm.read_user(addr, &mut buf)?;
            match buf.iter().position(|b| *b == 0) {
                Some(nul) => {
                    bytes.extend_from_slice(&buf[..nul]);
                    break;
                }
                None => bytes.extend_from_slice(&buf),
            }
            addr = addr.checked_add(chunk).ok_or(KernelError::BadAddress)?;
        }
        String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
    }
}
