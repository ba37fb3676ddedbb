//! Recording backend for layout tests.
//!
//! With the `mock` feature enabled, [`sys::mmap`](crate::sys::mmap) strips
//! `MAP_HUGETLB` and the encoded page-size selector before entering the
//! kernel, then logs the request it *would* have made. Tests get real,
//! writable memory (backed by base pages) on machines with no reserved huge
//! pages, and can still assert the exact materialization layout against the
//! event log.

use std::ffi::{c_int, c_void};
use std::sync::Mutex;

use crate::PageSize;

/// One observed mapping operation, as requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEvent {
    /// An `mmap` call that succeeded.
    Map {
        /// Address the kernel returned.
        addr: usize,
        /// Requested length in bytes.
        len: usize,
        /// Page size encoded in the requested flags.
        page_size: PageSize,
        /// Whether `MAP_FIXED` was requested.
        fixed: bool,
        /// Whether the mapping was file-backed (`fd >= 0`).
        file_backed: bool,
    },
    /// An `munmap` call that succeeded.
    Unmap {
        /// Unmapped base address.
        addr: usize,
        /// Unmapped length in bytes.
        len: usize,
    },
}

static EVENTS: Mutex<Vec<MapEvent>> = Mutex::new(Vec::new());

fn huge_size_bits() -> c_int {
    libc::MAP_HUGE_MASK << libc::MAP_HUGE_SHIFT
}

/// Remove the huge-page request bits so the kernel serves base pages.
pub fn scrub_map_flags(flags: c_int) -> c_int {
    flags & !(libc::MAP_HUGETLB | huge_size_bits())
}

fn page_size_of_flags(flags: c_int) -> PageSize {
    if flags & libc::MAP_HUGETLB == 0 {
        return PageSize::Base4Kb;
    }
    let log2 = (flags >> libc::MAP_HUGE_SHIFT) & libc::MAP_HUGE_MASK;
    PageSize::from_bytes(1u64 << log2).unwrap_or(PageSize::Base4Kb)
}

pub(crate) fn record_map(ret: *mut c_void, len: usize, requested_flags: c_int, fd: c_int) {
    if ret == libc::MAP_FAILED {
        return;
    }
    EVENTS.lock().unwrap().push(MapEvent::Map {
        addr: ret as usize,
        len,
        page_size: page_size_of_flags(requested_flags),
        fixed: requested_flags & libc::MAP_FIXED != 0,
        file_backed: fd >= 0,
    });
}

pub(crate) fn record_unmap(addr: *mut c_void, len: usize, ret: c_int) {
    if ret != 0 {
        return;
    }
    EVENTS.lock().unwrap().push(MapEvent::Unmap {
        addr: addr as usize,
        len,
    });
}

/// Replace an unmap with an inaccessible placeholder mapping.
///
/// Tests materialize and dematerialize regions while the harness runs other
/// tests on sibling threads; a genuine hole would let a foreign mapping (a
/// thread stack, an arena) land inside a region that is about to be remapped
/// with `MAP_FIXED`. Keeping the range reserved as `PROT_NONE` preserves the
/// observable region lifecycle without ever opening that hole.
pub(crate) unsafe fn reserve_instead_of_unmap(addr: *mut c_void, len: usize) -> c_int {
    let ret = libc::syscall(
        libc::SYS_mmap,
        addr,
        len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
        -1isize,
        0usize,
    ) as *mut c_void;
    if ret == libc::MAP_FAILED {
        return -1;
    }
    0
}

/// Drain and return every event recorded so far.
pub fn take_events() -> Vec<MapEvent> {
    std::mem::take(&mut *EVENTS.lock().unwrap())
}

/// Discard all recorded events.
pub fn clear_events() {
    EVENTS.lock().unwrap().clear();
}
