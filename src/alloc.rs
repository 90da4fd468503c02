//! Module for fallible allocation of shared-cache memory

use std::alloc::{alloc, dealloc, Layout};
use std::error::Error;
use std::fmt;
use std::ptr::NonNull;

/// Alignment of every block handed out for uncounted arrays.
pub const SHARED_ALIGN: usize = 16;

/// Error type for fallible allocation
/// This error is returned when an allocation fails.
/// It does not contain any additional information.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl Error for AllocError {}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

/// Sized allocator backing the shared cache.
///
/// Blocks are aligned to [`SHARED_ALIGN`], and `free` is always called with
/// the size that was passed to `allocate`.
pub trait SharedAllocator: Sync {
    /// Allocates `size` bytes.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Frees a block.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same `size`,
    /// and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// Layout of a shared block of `size` bytes.
pub fn shared_layout(size: usize) -> Result<Layout, AllocError> {
    Layout::from_size_align(size, SHARED_ALIGN).map_err(|_| AllocError)
}

/// Shared allocator backed by the global allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemSharedAllocator;

impl SharedAllocator for SystemSharedAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(size > 0);
        let layout = shared_layout(size)?;
        // Safety: layout has non-zero size
        NonNull::new(unsafe { alloc(layout) }).ok_or(AllocError)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        // Safety: the same layout was accepted by `allocate`
        dealloc(
            ptr.as_ptr(),
            Layout::from_size_align_unchecked(size, SHARED_ALIGN),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[mockalloc::test]
    fn system_allocator_round_trip() {
        let a = SystemSharedAllocator;
        let ptr = a.allocate(48).unwrap();
        assert_eq!(ptr.as_ptr() as usize % SHARED_ALIGN, 0);
        unsafe { a.free(ptr, 48) };
    }

    #[test]
    fn oversized_layout_is_an_error() {
        assert_eq!(shared_layout(usize::MAX), Err(AllocError));
    }
}
