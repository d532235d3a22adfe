//! Virtual addressing of a 32-bit machine.
//!
//! The 4 GiB virtual address space is split at [`PHYS_BASE`]. Addresses below
//! it belong to the user program of the running process; addresses at and
//! above it belong to the kernel, which maps all of physical memory there.
//! The kernel therefore refers to a physical frame through its kernel virtual
//! address ([`Kva`]), and to user memory through a [`Va`].
//!
//! Both types support the arithmetic that address manipulation needs:
//!
//! ```
//! use keel_machine::addressing::{PAGE_SIZE, Va};
//!
//! let va = Va::new(0x0804_8123).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x0804_8000);
//! assert_eq!(va.offset(), 0x123);
//! assert_eq!((va.page_down() + PAGE_SIZE).into_usize(), 0x0804_9000);
//! ```

/// Size of a page.
pub const PAGE_SIZE: usize = 0x1000;

/// Number of bits of the offset within a page.
pub const PAGE_SHIFT: usize = 12;

/// Mask of the offset within a page.
pub const PAGE_MASK: usize = 0xfff;

/// Boundary between user and kernel virtual memory.
pub const PHYS_BASE: usize = 0xc000_0000;

const ADDRESS_LIMIT: usize = u32::MAX as usize;

/// Kernel virtual address of a byte of physical memory.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Kva(usize);

impl Kva {
    /// Creates a kernel virtual address, if `addr` lies in kernel space.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr >= PHYS_BASE && addr <= ADDRESS_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// A virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Creates a virtual address, if `addr` fits in 32 bits.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr <= ADDRESS_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Is this a user virtual address?
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < PHYS_BASE
    }

    /// Adds `len`, failing on overflow of the 32-bit address space.
    #[inline]
    pub fn checked_add(self, len: usize) -> Option<Self> {
        self.0.checked_add(len).and_then(Self::new)
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 += other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 -= other
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:#010x})", stringify!($t), self.0)
            }
        }
    };
}

impl_arith!(Kva);
impl_arith!(Va);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_at_phys_base() {
        assert!(Va::new(PHYS_BASE - 1).unwrap().is_user());
        assert!(!Va::new(PHYS_BASE).unwrap().is_user());
        assert!(Kva::new(PHYS_BASE - 1).is_none());
        assert!(Va::new(ADDRESS_LIMIT + 1).is_none());
    }

    #[test]
    fn checked_add_detects_wraparound() {
        let top = Va::new(0xffff_f000).unwrap();
        assert!(top.checked_add(PAGE_SIZE).is_none());
        assert_eq!(
            top.checked_add(PAGE_SIZE - 1).map(Va::into_usize),
            Some(0xffff_ffff)
        );
    }
}
