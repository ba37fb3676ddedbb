//! End-to-end interposition against base-page-only pools.
//!
//! The whole flow runs as one sequential test: the interposer is process
//! state (environment, lifecycle gate, fixed brk anchor), so scenario steps
//! share one initialization and must not race each other.
//!
//! The layout uses no huge intervals, so this passes on any Linux box with no
//! reserved huge pages.

use std::ffi::c_void;
use std::io::{Seek, SeekFrom, Write};

use mosalloc::hooks;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

const LAYOUT: &str = "\
type,page_size,start_offset,end_offset
mmap,-1,0,67108864
brk,-1,0,33554432
file,-1,0,16777216
";

fn write_layout() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(LAYOUT.as_bytes()).unwrap();
    file
}

unsafe fn anon_mmap(len: usize) -> *mut u8 {
    let ptr = hooks::mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    assert_ne!(ptr, libc::MAP_FAILED);
    ptr.cast()
}

#[test]
fn test_interposition_end_to_end() {
    let layout = write_layout();
    std::env::set_var("HPC_CONFIGURATION_FILE", layout.path());
    std::env::set_var("HPC_MMAP_FIRST_FIT_LIST_SIZE", "256");
    std::env::set_var("HPC_FILE_BACKED_FIRST_FIT_LIST_SIZE", "64");
    mosalloc::init();

    unsafe {
        // --- program break growth through the brk pool ---
        let base = hooks::sbrk(0);
        assert_ne!(base, usize::MAX as *mut c_void);

        let mut expected = base as usize;
        for _ in 0..4 {
            let prev = hooks::sbrk(2 * MB as isize);
            assert_eq!(prev as usize, expected, "sbrk must return the old top");
            // the grown range is writable
            std::ptr::write_bytes(prev.cast::<u8>(), 0x7e, 2 * MB);
            expected += 2 * MB;
        }
        assert_eq!(hooks::sbrk(0) as usize, expected);

        // shrinking and growing again stays consistent
        let prev = hooks::sbrk(-(2 * MB as isize));
        assert_eq!(prev as usize, expected);
        assert_eq!(hooks::sbrk(0) as usize, expected - 2 * MB);

        // moving below the pool base is refused
        let below = hooks::sbrk(-(64 * MB as isize));
        assert_eq!(below, usize::MAX as *mut c_void);

        // brk to an absolute address inside the pool succeeds, below it fails
        assert_eq!(hooks::brk((base as usize + 4 * MB) as *mut c_void), 0);
        assert_eq!(hooks::brk((base as usize - 4 * KB) as *mut c_void), -1);
        // the sbrk cursor is its own bookkeeping, unaffected by raw brk moves
        assert_eq!(hooks::sbrk(0) as usize, expected - 2 * MB);

        // --- anonymous mmap served from the anon pool ---
        let first = anon_mmap(4 * MB);
        let second = anon_mmap(4 * MB);
        assert_ne!(first, second);
        assert_eq!(second as usize, first as usize + 4 * MB);
        std::ptr::write_bytes(first, 0x11, 4 * MB);
        std::ptr::write_bytes(second, 0x22, 4 * MB);
        assert_eq!(*first.add(4 * MB - 1), 0x11);
        assert_eq!(*second, 0x22);

        // pool protections are fixed: mprotect on managed memory is a no-op
        // success
        assert_eq!(
            hooks::mprotect(first.cast(), 4 * KB, libc::PROT_NONE),
            0
        );
        assert_eq!(*first, 0x11, "managed memory must stay accessible");

        // freeing the first block makes its range available again
        assert_eq!(hooks::munmap(first.cast(), 4 * MB), 0);
        let again = anon_mmap(4 * MB);
        assert_eq!(again, first, "freed range must be reused first-fit");

        // an address the pools never handed out is declined
        assert_eq!(hooks::munmap(0x1000 as *mut c_void, 4 * KB), -1);
        // and so is a double free
        assert_eq!(hooks::munmap(second.cast(), 4 * MB), 0);
        assert_eq!(hooks::munmap(second.cast(), 4 * MB), -1);

        // --- file-backed mmap through the file pool ---
        let mut data_file = tempfile::NamedTempFile::new().unwrap();
        data_file.write_all(&[0xa5u8; 8 * KB]).unwrap();
        data_file.flush().unwrap();
        data_file.seek(SeekFrom::Start(0)).unwrap();
        let fd = {
            use std::os::unix::io::AsRawFd;
            data_file.as_file().as_raw_fd()
        };

        let mapped = hooks::mmap(
            std::ptr::null_mut(),
            8 * KB,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        );
        assert_ne!(mapped, libc::MAP_FAILED);
        let bytes = std::slice::from_raw_parts(mapped.cast::<u8>(), 8 * KB);
        assert!(bytes.iter().all(|&b| b == 0xa5));

        // a second file mapping gets a distinct placement
        let mapped_again = hooks::mmap(
            std::ptr::null_mut(),
            8 * KB,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        );
        assert_ne!(mapped_again, libc::MAP_FAILED);
        assert_ne!(mapped_again, mapped);

        assert_eq!(hooks::munmap(mapped, 8 * KB), 0);
        assert_eq!(hooks::munmap(mapped_again, 8 * KB), 0);
    }
}
