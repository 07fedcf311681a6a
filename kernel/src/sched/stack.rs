//! Thread stacks
//!
//! Each runtime thread owns one heap-allocated stack. The stack is freed
//! exactly once, when the owning handle is joined.

use alloc::alloc::{alloc, dealloc, Layout};
use core::fmt;
use core::ptr::NonNull;

use crate::error::{Error, Result};

/// AAPCS64 requires a 16-byte aligned stack pointer
pub const STACK_ALIGN: usize = 16;

/// Smallest stack accepted by the thread builder
pub const MIN_STACK_SIZE: usize = 1024;

pub struct Stack {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is owned exclusively by this value
unsafe impl Send for Stack {}

impl Stack {
    pub fn new(size: usize) -> Result<Self> {
        if size < MIN_STACK_SIZE {
            return Err(Error::InvalidArgument);
        }
        let layout = Layout::from_size_align(size, STACK_ALIGN).map_err(|_| Error::OutOfMemory)?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc(layout) };
        let base = NonNull::new(ptr).ok_or(Error::OutOfMemory)?;
        Ok(Self { base, layout })
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn bottom(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Initial stack pointer; the stack grows down from here.
    pub fn top(&self) -> usize {
        (self.bottom() + self.size()) & !(STACK_ALIGN - 1)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stack({:#x}..{:#x})", self.bottom(), self.top())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_bounds() {
        let stack = Stack::new(16 * 1024).unwrap();
        assert_eq!(stack.size(), 16 * 1024);
        assert_eq!(stack.top() % STACK_ALIGN, 0);
        assert_eq!(stack.top() - stack.bottom(), 16 * 1024);
    }

    #[test]
    fn test_too_small_stack_rejected() {
        assert_eq!(Stack::new(0).unwrap_err(), Error::InvalidArgument);
        assert_eq!(Stack::new(MIN_STACK_SIZE - 1).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_unsatisfiable_stack_is_out_of_memory() {
        assert_eq!(Stack::new(1 << 62).unwrap_err(), Error::OutOfMemory);
        assert_eq!(Stack::new(usize::MAX).unwrap_err(), Error::OutOfMemory);
    }
}
