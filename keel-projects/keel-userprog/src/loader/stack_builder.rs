//! [`StackBuilder`], a utility for constructing a user-space stack layout.
use keel::{
    KernelError,
    addressing::{PAGE_SIZE, PHYS_BASE, Va},
};
use keel_vm::MmStruct;

/// Top of every user stack.
pub const USER_STACK_TOP: usize = PHYS_BASE;

/// A utility for constructing a user-space stack layout.
///
/// The stack is the single page right below [`PHYS_BASE`]. It grows downward
/// from its top; pushing past the bottom of the page fails with
/// [`KernelError::NoMemory`] and leaves the stack pointer unchanged.
///
/// # Usage
/// 1. **Create a new stack** using [`StackBuilder::new`], which registers
///    the stack page and loads it.
/// 2. **Push data** (e.g., argument strings and pointers) onto the stack.
/// 3. **Align the stack** for proper memory layout.
/// 4. **Finish** with [`StackBuilder::finish`] to get the initial stack
///    pointer.
pub struct StackBuilder<'a> {
    sp: Va,
    bottom: Va,
    mm_state: &'a MmStruct,
}

impl<'a> StackBuilder<'a> {
    /// Maps the stack page of `mm_state` and starts an empty stack on it.
    pub fn new(mm_state: &'a MmStruct) -> Result<Self, KernelError> {
        let top = Va::new(USER_STACK_TOP).ok_or(KernelError::BadAddress)?;
        let bottom = top - PAGE_SIZE;
        mm_state.map_zero_page(bottom, true)?;
        mm_state.load_page(bottom)?;
        Ok(Self {
            sp: top,
            bottom,
            mm_state,
        })
    }

    /// Consumes the builder and returns the stack pointer.
    pub fn finish(self) -> Va {
        self.sp
    }

    /// Returns the current stack pointer.
    #[inline]
    pub fn sp(&self) -> Va {
        self.sp
    }

    /// Bytes that can still be pushed.
    pub fn room(&self) -> usize {
        self.sp - self.bottom
    }

    /// Aligns the stack pointer down to `align` bytes, zeroing the padding.
    pub fn align(&mut self, align: usize) -> Result<Va, KernelError> {
        let pad = self.sp.into_usize() % align;
        self.push_bytes(&vec![0; pad])
    }

    /// Pushes `bytes` and returns the new stack pointer.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Va, KernelError> {
        if bytes.len() > self.room() {
            return Err(KernelError::NoMemory);
        }
        let sp = self.sp - bytes.len();
        self.mm_state.write_user(sp, bytes)?;
        self.sp = sp;
        Ok(sp)
    }

    /// Pushes a 32-bit word.
    pub fn push_u32(&mut self, v: u32) -> Result<Va, KernelError> {
        self.push_bytes(&v.to_le_bytes())
    }

    /// Pushes `s` as a NUL-terminated string and returns its address.
    pub fn push_str(&mut self, s: &str) -> Result<Va, KernelError> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.push_bytes(&bytes)
    }
}
