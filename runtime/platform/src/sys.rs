//! Direct system-call wrappers.
//!
//! The host process's `mmap`/`munmap`/`mprotect`/`brk`/`sbrk` symbols are the
//! shim's own exports, so the pool machinery reaches the kernel through
//! `syscall(2)` with explicit numbers. Going through the symbol table here
//! would recurse into the interposer (or worse, into the dynamic linker while
//! it is still resolving us).

use core::ffi::{c_int, c_void};

#[cfg(feature = "mock")]
use crate::mock;

/// Raw `mmap(2)`. Returns `MAP_FAILED` on error with errno set.
///
/// # Safety
/// Same contract as the syscall: `addr`/`length` describe address space the
/// caller is entitled to map over, in particular with `MAP_FIXED`.
pub unsafe fn mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    #[cfg(feature = "mock")]
    let requested_flags = flags;
    #[cfg(feature = "mock")]
    let flags = mock::scrub_map_flags(flags);

    let ret = libc::syscall(libc::SYS_mmap, addr, length, prot, flags, fd, offset) as *mut c_void;

    #[cfg(feature = "mock")]
    mock::record_map(ret, length, requested_flags, fd);

    ret
}

/// Raw `munmap(2)`. Returns 0 on success, -1 on error with errno set.
///
/// # Safety
/// `addr`/`length` must describe a mapping owned by the caller.
pub unsafe fn munmap(addr: *mut c_void, length: usize) -> c_int {
    #[cfg(feature = "mock")]
    let ret = mock::reserve_instead_of_unmap(addr, length);
    #[cfg(not(feature = "mock"))]
    let ret = libc::syscall(libc::SYS_munmap, addr, length) as c_int;

    #[cfg(feature = "mock")]
    mock::record_unmap(addr, length, ret);

    ret
}

/// Raw `mprotect(2)`. Returns 0 on success, -1 on error with errno set.
///
/// # Safety
/// Same contract as the syscall.
pub unsafe fn mprotect(addr: *mut c_void, length: usize, prot: c_int) -> c_int {
    libc::syscall(libc::SYS_mprotect, addr, length, prot) as c_int
}

/// Current program break (`brk(0)`).
pub fn current_brk() -> *mut c_void {
    unsafe { libc::syscall(libc::SYS_brk, 0usize) as *mut c_void }
}

/// Raw `brk(2)` with the libc wrapper's 0/-1 convention.
pub fn brk(addr: *mut c_void) -> c_int {
    let ret = unsafe { libc::syscall(libc::SYS_brk, addr) as *mut c_void };
    if ret < addr {
        crate::set_errno(libc::ENOMEM);
        return -1;
    }
    0
}

/// Raw `sbrk` built from two `brk` syscalls.
///
/// Returns the previous break on success and `-1 as *mut c_void` with errno
/// `ENOMEM` on failure, matching the libc wrapper.
pub fn sbrk(increment: isize) -> *mut c_void {
    let current = current_brk();
    if current == usize::MAX as *mut c_void {
        return usize::MAX as *mut c_void;
    }
    let requested = (current as isize + increment) as *mut c_void;
    let achieved = unsafe { libc::syscall(libc::SYS_brk, requested) as *mut c_void };
    if achieved == usize::MAX as *mut c_void || achieved < requested {
        crate::set_errno(libc::ENOMEM);
        return usize::MAX as *mut c_void;
    }
    current
}

/// Kernel thread id of the calling thread.
pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}
