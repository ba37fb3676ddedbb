//! The interposed process symbols.
//!
//! Exported with their exact libc signatures so the dynamic linker resolves
//! application calls here. Every hook goes through the lifecycle gate first:
//! the first call in a fresh process builds the pools, and calls that find
//! the gate closed (construction in flight, torn down) fall through to the
//! raw syscall.

use core::ffi::{c_int, c_void};

use mosalloc_platform::{set_errno, sys};

use crate::context;

/// Interposed `mmap(2)`.
///
/// File-backed requests (`fd >= 0`) are placed by the file pool; anonymous
/// requests are served from the anon pool regardless of the hinted address.
///
/// # Safety
/// libc `mmap` contract.
#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    match context::get_or_init() {
        None => sys::mmap(addr, length, prot, flags, fd, offset),
        Some(context) => {
            if fd >= 0 {
                context.allocator().allocate_file(addr, length, prot, flags, fd, offset)
            } else {
                context.allocator().allocate_anon(length).cast()
            }
        }
    }
}

/// Interposed `munmap(2)`.
///
/// Pool-owned ranges go back to their pool; anything else is declined with
/// `-1` (the pools never forget an address they handed out, so an unknown
/// address is a caller bug).
///
/// # Safety
/// libc `munmap` contract.
#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, length: usize) -> c_int {
    match context::get_or_init() {
        None => sys::munmap(addr, length),
        Some(context) => match context.allocator().deallocate_mmap(addr.cast(), length) {
            Ok(()) => 0,
            Err(error) => {
                log::debug!("munmap({addr:p}, {length}) declined: {error}");
                set_errno(libc::EINVAL);
                -1
            }
        },
    }
}

/// Interposed `mprotect(2)`.
///
/// Pool memory has its protections fixed at read+write for the lifetime of
/// the process, so requests against managed ranges succeed without doing
/// anything. The check reads fixed spans and takes no lock.
///
/// # Safety
/// libc `mprotect` contract.
#[no_mangle]
pub unsafe extern "C" fn mprotect(addr: *mut c_void, len: usize, prot: c_int) -> c_int {
    if let Some(context) = context::get_or_init() {
        if context.allocator().contains_huge_region(addr as usize) {
            return 0;
        }
    }
    sys::mprotect(addr, len, prot)
}

/// Interposed `brk(2)`.
///
/// # Safety
/// libc `brk` contract.
#[no_mangle]
pub unsafe extern "C" fn brk(addr: *mut c_void) -> c_int {
    match context::get_or_init() {
        None => sys::brk(addr),
        Some(context) => match context.allocator().change_program_break(addr as usize) {
            Ok(()) => 0,
            Err(_) => {
                set_errno(libc::ENOMEM);
                -1
            }
        },
    }
}

/// Interposed `sbrk(2)`.
///
/// Tracks its own break cursor starting at the brk pool base; returns the
/// previous cursor on success, `-1` with errno `ENOMEM` on failure.
///
/// # Safety
/// libc `sbrk` contract.
#[no_mangle]
pub unsafe extern "C" fn sbrk(increment: isize) -> *mut c_void {
    match context::get_or_init() {
        None => sys::sbrk(increment),
        Some(context) => context.sbrk(increment),
    }
}

/// Grow hook for the downstream malloc: `sbrk` plus the sentinel the startup
/// drain watches for.
///
/// # Safety
/// Same contract as `sbrk`.
#[no_mangle]
pub unsafe extern "C" fn morecore(increment: isize) -> *mut c_void {
    context::note_morecore();
    sbrk(increment)
}
