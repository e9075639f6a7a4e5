//! Utility functions
//!
//! Power-of-two arithmetic and aligned allocation.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Check if a value is a power of two
#[inline]
pub const fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Check if a value fits in a signed 32-bit size
#[inline]
pub const fn is_32_bit(n: u64) -> bool {
    n <= i32::MAX as u64 + 1
}

/// Floor of log2; `n` must be non-zero
#[inline]
pub const fn log2(n: u64) -> u32 {
    debug_assert!(n != 0);
    63 - n.leading_zeros()
}

/// RAII wrapper for aligned, zero-initialised memory
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a new zeroed buffer of `size` bytes aligned to `alignment`.
    ///
    /// Returns `None` if the layout is invalid or the allocator is out of memory.
    pub fn zeroed(alignment: usize, size: usize) -> Option<Self> {
        if size == 0 || !is_power_of_two(alignment as u64) {
            return None;
        }
        let layout = Layout::from_size_align(size, alignment).ok()?;
        // SAFETY: `layout` has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }

    /// Get a pointer to the buffer
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr() as *const u8
    }

    /// Get the size of the buffer
    #[cfg(test)]
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Get the alignment of the buffer
    #[inline]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with exactly `layout`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// Safety: AlignedBuffer owns its memory and doesn't share references
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}
