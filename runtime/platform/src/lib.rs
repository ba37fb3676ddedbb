//! # Mosalloc platform layer
//!
//! Raw kernel entry points for the pool allocator, plus the handful of
//! process-wide primitives every other crate leans on: hardware page sizes,
//! alignment arithmetic and the allocation-free fatal-error path.
//!
//! The shim interposes the libc memory symbols of the host process, so this
//! crate must never call them back: every kernel interaction goes through
//! `syscall(2)` with explicit syscall numbers (see [`sys`]). There is no
//! runtime symbol lookup anywhere on this path.
//!
//! ## Build Modes
//!
//! ```bash
//! # Real syscalls (default)
//! cargo build
//!
//! # Recording backend for layout tests (strips MAP_HUGETLB, logs events)
//! cargo test --features mock
//! ```

pub mod sys;

#[cfg(feature = "mock")]
pub mod mock;

use core::ffi::c_int;

/// Hardware page sizes the pools can materialize.
///
/// Every size and offset in the system is a multiple of [`PageSize::Base4Kb`];
/// the huge sizes are used for whole intervals only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u64)]
pub enum PageSize {
    /// 4KB base page
    Base4Kb = 4096,
    /// 2MB huge page
    Huge2Mb = 2 * 1024 * 1024,
    /// 1GB huge page
    Huge1Gb = 1024 * 1024 * 1024,
}

impl PageSize {
    /// Size in bytes.
    #[inline]
    pub const fn bytes(self) -> u64 {
        self as u64
    }

    /// Check if `value` is a multiple of this page size.
    #[inline]
    pub const fn is_aligned(self, value: u64) -> bool {
        value & (self.bytes() - 1) == 0
    }

    /// Parse a byte count, accepting only the supported sizes.
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            4096 => Some(PageSize::Base4Kb),
            2097152 => Some(PageSize::Huge2Mb),
            1073741824 => Some(PageSize::Huge1Gb),
            _ => None,
        }
    }

    /// The extra `mmap` flags that request this page size from the kernel.
    ///
    /// Base pages need no flags; huge pages need `MAP_HUGETLB` plus the
    /// encoded page-size selector.
    pub const fn mmap_flags(self) -> c_int {
        match self {
            PageSize::Base4Kb => 0,
            PageSize::Huge2Mb => libc::MAP_HUGETLB | libc::MAP_HUGE_2MB,
            PageSize::Huge1Gb => libc::MAP_HUGETLB | libc::MAP_HUGE_1GB,
        }
    }
}

static_assertions::const_assert_eq!(PageSize::Huge2Mb.bytes(), 1 << 21);
static_assertions::const_assert_eq!(PageSize::Huge1Gb.bytes(), 1 << 30);

/// Round `value` up to the next multiple of `align`.
#[inline]
pub const fn round_up(value: u64, align: u64) -> u64 {
    ((value + align - 1) / align) * align
}

/// Round `value` down to a multiple of `align`.
#[inline]
pub const fn round_down(value: u64, align: u64) -> u64 {
    (value / align) * align
}

/// Check that `value` is a multiple of `align`.
#[inline]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value % align == 0
}

/// Report an unrecoverable error and terminate the process.
///
/// This can be reached from inside `malloc` (the pools back the process
/// allocator), so it must not allocate or take locks: plain `write(2)` to
/// stderr followed by `_exit(1)`.
pub fn fatal(msg: &str) -> ! {
    let prefix = b"mosalloc: fatal: ";
    unsafe {
        libc::write(libc::STDERR_FILENO, prefix.as_ptr().cast(), prefix.len());
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        libc::_exit(1);
    }
}

/// Read the calling thread's errno.
pub fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

/// Set the calling thread's errno.
pub fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value }
}
