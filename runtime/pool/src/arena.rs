//! Fixed-capacity backing stores obtained from the raw mmap path.
//!
//! The interval lists and the FFA node arena live for the whole process and
//! are built while the shim may already be interposing the process allocator,
//! so their storage must come straight from the kernel.

use core::ffi::c_void;
use core::ptr;

use mosalloc_platform::{fatal, round_up, sys, PageSize};

/// A raw anonymous mapping holding `capacity` elements of `T`.
///
/// The store never reallocates; growing past capacity is the caller's bug.
pub(crate) struct RawStore<T> {
    ptr: *mut T,
    bytes: usize,
}

impl<T> RawStore<T> {
    /// Map storage for `capacity` elements, rounded up to whole base pages.
    ///
    /// A zero capacity maps nothing and yields a dangling, never-dereferenced
    /// pointer.
    pub(crate) fn new(capacity: usize) -> Self {
        if capacity == 0 {
            return Self {
                ptr: ptr::NonNull::dangling().as_ptr(),
                bytes: 0,
            };
        }
        let bytes = round_up(
            (capacity * core::mem::size_of::<T>()) as u64,
            PageSize::Base4Kb.bytes(),
        ) as usize;
        let ptr = unsafe {
            sys::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            fatal("failed to map backing store");
        }
        Self {
            ptr: ptr.cast(),
            bytes,
        }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr
    }
}

impl<T> Drop for RawStore<T> {
    fn drop(&mut self) {
        if self.bytes == 0 {
            return;
        }
        unsafe {
            sys::munmap(self.ptr.cast::<c_void>(), self.bytes);
        }
    }
}

// The store is plain memory; the wrapping types enforce their own discipline.
unsafe impl<T: Send> Send for RawStore<T> {}
