//! Page-size faithfulness against the kernel, via `/proc/self/numa_maps`.
//!
//! Requires pre-reserved huge pages (at least 1x 1GB and 25x 2MB, e.g.
//! `hugeadm` or `nr_hugepages` sysctls) and is therefore ignored by default:
//!
//! ```bash
//! cargo test -p mosalloc --test hugepage_numa_maps -- --ignored
//! ```

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::io::Write;

use mosalloc::hooks;

const MB: usize = 1024 * 1024;

const LAYOUT: &str = "\
type,page_size,start_offset,end_offset
mmap,-1,0,2147483648
mmap,2097152,12582912,65011712
mmap,1073741824,117440512,1191182336
brk,-1,0,16777216
file,-1,0,16777216
";

/// Map of region start address to `kernelpagesize_kB`, read from
/// `/proc/self/numa_maps`.
fn read_numa_maps() -> BTreeMap<usize, u64> {
    let line_re = regex::Regex::new(r"^([0-9a-fA-F]+) ").unwrap();
    let page_size_re = regex::Regex::new(r"kernelpagesize_kB=(\d+)").unwrap();

    let contents = std::fs::read_to_string("/proc/self/numa_maps").unwrap();
    let mut ranges = BTreeMap::new();
    for line in contents.lines() {
        let Some(addr) = line_re
            .captures(line)
            .and_then(|c| usize::from_str_radix(&c[1], 16).ok())
        else {
            continue;
        };
        let Some(kb) = page_size_re
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok())
        else {
            continue;
        };
        ranges.insert(addr, kb);
    }
    ranges
}

/// Page size backing `addr`: the entry of the nearest region at or below it.
fn page_size_at(ranges: &BTreeMap<usize, u64>, addr: usize) -> Option<u64> {
    ranges.range(..=addr).next_back().map(|(_, kb)| *kb)
}

#[test]
#[ignore = "needs pre-reserved huge pages (1x 1GB, 25x 2MB)"]
fn test_mixed_layout_backed_by_prescribed_page_sizes() {
    let mut layout = tempfile::NamedTempFile::new().unwrap();
    layout.write_all(LAYOUT.as_bytes()).unwrap();
    std::env::set_var("HPC_CONFIGURATION_FILE", layout.path());
    std::env::set_var("HPC_MMAP_FIRST_FIT_LIST_SIZE", "64");
    std::env::set_var("HPC_FILE_BACKED_FIRST_FIT_LIST_SIZE", "64");
    mosalloc::init();

    let base = unsafe {
        let ptr = hooks::mmap(
            std::ptr::null_mut(),
            2048 * MB,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert_ne!(ptr, libc::MAP_FAILED);
        // dirty every page so numa_maps reports them all
        std::ptr::write_bytes(ptr.cast::<u8>(), 0xff, 2048 * MB);
        ptr as usize
    };

    let ranges = read_numa_maps();

    // |4KB 0..12MB |2MB 12..62MB |4KB 62..112MB |1GB 112..1136MB |4KB tail|
    assert_eq!(page_size_at(&ranges, base), Some(4));
    assert_eq!(page_size_at(&ranges, base + 12 * MB), Some(2048));
    assert_eq!(page_size_at(&ranges, base + 62 * MB), Some(4));
    assert_eq!(page_size_at(&ranges, base + 112 * MB), Some(1048576));
    assert_eq!(page_size_at(&ranges, base + 1136 * MB), Some(4));

    unsafe {
        assert_eq!(hooks::munmap(base as *mut c_void, 2048 * MB), 0);
    }
}
