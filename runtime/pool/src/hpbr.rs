//! Huge-page-backed regions.
//!
//! A region is one contiguous virtual-address range whose sub-intervals are
//! materialized with prescribed hardware page sizes as the region grows and
//! shrinks. The region base is chosen so that every huge-page interval lands
//! on a boundary of its own page size, which is what lets the kernel satisfy
//! the `MAP_HUGETLB` fixed mappings.
//!
//! Regions live for the whole process. Nothing here unmaps a region at
//! teardown: by exit time other loaded objects still hold pointers into the
//! pools.

use core::ffi::c_void;
use core::ptr;

use mosalloc_platform::{fatal, round_up, sys, PageSize};

use crate::interval::{MemoryInterval, MemoryIntervalList};
use crate::{PoolError, Result};

const MAP_PROT: i32 = libc::PROT_READ | libc::PROT_WRITE;
const MAP_FLAGS: i32 = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

/// A contiguous region with a fixed mixed-page-size layout.
pub struct HugePageBackedRegion {
    base: usize,
    max_size: u64,
    current_size: u64,
    /// The completed layout: the caller's huge intervals plus explicit 4KB
    /// intervals filling every gap, partitioning `[0, max_size)`.
    intervals: MemoryIntervalList,
}

// The region is a value type over raw addresses; access is serialized by the
// owning pool's lock.
unsafe impl Send for HugePageBackedRegion {}

impl HugePageBackedRegion {
    /// Reserve and materialize a region of `region_size` bytes laid out as
    /// `layout` prescribes.
    ///
    /// `region_base` pins the reservation to a fixed address (the brk pool
    /// anchors at the program break); otherwise the kernel picks. The region
    /// comes back fully materialized; callers that want to start empty resize
    /// to zero afterwards.
    ///
    /// Initialization failures are unrecoverable: the process cannot run
    /// without the promised layout, so errors report and exit.
    pub fn new(region_size: u64, layout: &MemoryIntervalList, region_base: Option<usize>) -> Self {
        if !PageSize::Base4Kb.is_aligned(region_size) {
            fatal("region size is not aligned to 4KB");
        }

        // the largest page size present dictates reservation slack and base
        // alignment
        let largest = if layout.first_of(PageSize::Huge1Gb).is_some() {
            PageSize::Huge1Gb
        } else if layout.first_of(PageSize::Huge2Mb).is_some() {
            PageSize::Huge2Mb
        } else {
            PageSize::Base4Kb
        };

        // scratch reservation with base pages; one extra `largest` page of
        // slack leaves room to slide the base onto an aligned address
        let scratch_len = if largest == PageSize::Base4Kb {
            region_size
        } else {
            round_up(region_size + largest.bytes(), largest.bytes())
        };
        let scratch = map_scratch(region_base, scratch_len as usize);

        // place the first interval of the largest page size on a boundary of
        // that size; slack before/after the region is tolerated
        let base = match layout.first_of(largest) {
            Some(first) => {
                (round_up(scratch as u64 + first.start, largest.bytes()) - first.start) as usize
            }
            None => scratch,
        };

        // complete the layout: copy, sort, and fill every gap (head, middle,
        // tail) with explicit 4KB intervals
        let mut intervals = MemoryIntervalList::new(2 * layout.len() + 1);
        for iv in layout.iter() {
            intervals.push(iv.start, iv.end, iv.page_size);
        }
        intervals.sort();
        let supplied = intervals.len();
        let mut prev_end = 0;
        for i in 0..supplied {
            let iv = intervals.as_slice()[i];
            if prev_end < iv.start {
                intervals.push(prev_end, iv.start, PageSize::Base4Kb);
            }
            prev_end = iv.end;
        }
        if prev_end < region_size {
            intervals.push(prev_end, region_size, PageSize::Base4Kb);
        }
        intervals.sort();

        unmap_range(scratch, scratch_len as usize);

        let mut region = Self {
            base,
            max_size: region_size,
            current_size: 0,
            intervals,
        };

        // materialize everything once; huge-page rounding decides the
        // authoritative maximum
        match region.resize(region_size) {
            Ok(achieved) => region.max_size = achieved,
            Err(_) => fatal("initial region materialization failed"),
        }

        log::info!(
            "region mapped at {:#x}, size {} bytes, {} intervals",
            region.base,
            region.max_size,
            region.intervals.len()
        );

        region
    }

    /// Grow or shrink the materialized range to cover `[0, new_size)`.
    ///
    /// Returns the size actually achieved, which can exceed `new_size` when a
    /// huge interval forces whole-page rounding. Equal sizes are a no-op, so
    /// repeating a resize changes nothing.
    pub fn resize(&mut self, new_size: u64) -> Result<u64> {
        if new_size > self.max_size {
            return Err(PoolError::OutOfRange {
                requested: new_size,
                max: self.max_size,
            });
        }

        if new_size > self.current_size {
            self.current_size = self.extend(new_size);
        } else if new_size < self.current_size {
            self.current_size = self.shrink(new_size);
        }
        Ok(self.current_size)
    }

    /// Map every not-yet-materialized portion of the intervals overlapping
    /// `[current_size, new_size)`, each with its prescribed page size.
    fn extend(&mut self, new_size: u64) -> u64 {
        let current = self.current_size;
        let mut achieved = current;
        for i in 0..self.intervals.len() {
            let iv = self.intervals.as_slice()[i];
            if (current >= iv.start || new_size >= iv.start) && current < iv.end {
                let sub_start = iv.start.max(current);
                let sub_end = if new_size <= iv.end {
                    iv.start + round_up(new_size - iv.start, iv.page_size.bytes())
                } else {
                    iv.end
                };
                self.map_fixed(sub_start, sub_end.saturating_sub(sub_start), iv.page_size);
                achieved = sub_end;
            }
        }
        log::debug!("region {:#x} extended to {} bytes", self.base, achieved);
        achieved
    }

    /// Unmap the tail of every interval overlapping `[new_size,
    /// current_size)`. The kept prefix of a huge interval is rounded up to a
    /// whole page: a partial huge page is never split by an unmap, so the
    /// achieved size can exceed the request.
    fn shrink(&mut self, new_size: u64) -> u64 {
        let current = self.current_size;
        let mut achieved = current;
        for i in 0..self.intervals.len() {
            let iv = self.intervals.as_slice()[i];
            if (current <= iv.end || new_size <= iv.end) && current > iv.start {
                let un_end = iv.end.min(current);
                let un_start = if new_size >= iv.start {
                    iv.start + round_up(new_size - iv.start, iv.page_size.bytes())
                } else {
                    iv.start
                };
                if un_start < un_end {
                    unmap_range(
                        self.base + un_start as usize,
                        (un_end - un_start) as usize,
                    );
                }
                if un_start < achieved {
                    achieved = un_start;
                }
            }
        }
        log::debug!("region {:#x} shrunk to {} bytes", self.base, achieved);
        achieved
    }

    fn map_fixed(&self, offset: u64, len: u64, page_size: PageSize) {
        if len == 0 {
            return;
        }
        let addr = (self.base + offset as usize) as *mut c_void;
        let flags = MAP_FLAGS | libc::MAP_FIXED | page_size.mmap_flags();
        let ptr = unsafe { sys::mmap(addr, len as usize, MAP_PROT, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            fatal("failed to materialize region memory by mmap");
        }
    }

    /// Base address of the region.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Currently materialized size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.current_size
    }

    /// The fixed maximum size in bytes.
    #[inline]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// The completed interval layout partitioning `[0, max_size)`.
    pub fn intervals(&self) -> &[MemoryInterval] {
        self.intervals.as_slice()
    }
}

fn map_scratch(fixed_base: Option<usize>, len: usize) -> usize {
    let (hint, flags) = match fixed_base {
        Some(base) => (base as *mut c_void, MAP_FLAGS | libc::MAP_FIXED),
        None => (ptr::null_mut(), MAP_FLAGS),
    };
    let ptr = unsafe { sys::mmap(hint, len, MAP_PROT, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        fatal("failed to reserve region address space");
    }
    ptr as usize
}

fn unmap_range(addr: usize, len: usize) {
    if len == 0 {
        return;
    }
    if unsafe { sys::munmap(addr as *mut c_void, len) } != 0 {
        fatal("failed to unmap region memory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    // serializes the tests that drain the shared event log
    static EVENT_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn layout_of(intervals: &[(u64, u64, PageSize)]) -> MemoryIntervalList {
        let mut list = MemoryIntervalList::new(intervals.len().max(1));
        for &(start, end, page_size) in intervals {
            list.push(start, end, page_size);
        }
        list
    }

    fn assert_partition(region: &HugePageBackedRegion) {
        let mut expected_start = 0;
        for iv in region.intervals() {
            assert_eq!(iv.start, expected_start, "layout has a hole");
            assert!(iv.end > iv.start);
            expected_start = iv.end;
        }
        assert!(expected_start >= region.max_size());
    }

    #[test]
    fn test_base_page_region_partition() {
        let layout = layout_of(&[]);
        let mut region = HugePageBackedRegion::new(16 * MB, &layout, None);
        assert_eq!(region.max_size(), 16 * MB);
        assert_eq!(region.size(), 16 * MB);
        assert_eq!(region.intervals().len(), 1);
        assert_partition(&region);

        assert_eq!(region.resize(0).unwrap(), 0);
        assert_eq!(region.size(), 0);
    }

    #[test]
    fn test_mixed_region_partition_and_alignment() {
        let layout = layout_of(&[
            (12 * MB, 62 * MB, PageSize::Huge2Mb),
            (112 * MB, 112 * MB + GB, PageSize::Huge1Gb),
        ]);
        let region = HugePageBackedRegion::new(2 * GB, &layout, None);

        // five intervals: 4KB | 2MB | 4KB | 1GB | 4KB
        let kinds: Vec<PageSize> = region.intervals().iter().map(|iv| iv.page_size).collect();
        assert_eq!(
            kinds,
            vec![
                PageSize::Base4Kb,
                PageSize::Huge2Mb,
                PageSize::Base4Kb,
                PageSize::Huge1Gb,
                PageSize::Base4Kb,
            ]
        );
        assert_partition(&region);

        // the 1GB interval sits on a 1GB boundary in the address space
        let addr_1gb = region.base() as u64 + 112 * MB;
        assert!(PageSize::Huge1Gb.is_aligned(addr_1gb));
        // and therefore the 2MB interval on a 2MB boundary
        let addr_2mb = region.base() as u64 + 12 * MB;
        assert!(PageSize::Huge2Mb.is_aligned(addr_2mb));
    }

    #[test]
    fn test_region_memory_is_writable() {
        let layout = layout_of(&[(2 * MB, 6 * MB, PageSize::Huge2Mb)]);
        let mut region = HugePageBackedRegion::new(8 * MB, &layout, None);
        assert_eq!(region.size(), 8 * MB);

        unsafe {
            let base = region.base() as *mut u8;
            core::ptr::write_bytes(base, 0xff, (8 * MB) as usize);
            assert_eq!(*base, 0xff);
            assert_eq!(*base.add((8 * MB) as usize - 1), 0xff);
        }

        assert_eq!(region.resize(0).unwrap(), 0);
    }

    #[test]
    fn test_resize_rejects_past_max() {
        let layout = layout_of(&[]);
        let mut region = HugePageBackedRegion::new(4 * MB, &layout, None);
        assert!(matches!(
            region.resize(4 * MB + 4 * KB),
            Err(PoolError::OutOfRange { .. })
        ));
        // the failed resize changed nothing
        assert_eq!(region.size(), 4 * MB);
    }

    #[test]
    fn test_resize_idempotence() {
        let _guard = EVENT_LOCK.lock().unwrap();
        let layout = layout_of(&[(0, 4 * MB, PageSize::Huge2Mb)]);
        let mut region = HugePageBackedRegion::new(8 * MB, &layout, None);
        region.resize(0).unwrap();

        let first = region.resize(5 * MB).unwrap();
        mosalloc_platform::mock::clear_events();
        let second = region.resize(5 * MB).unwrap();
        assert_eq!(first, second);

        // the repeated resize touched nothing inside the region
        let base = region.base();
        let max = region.max_size() as usize;
        let touched = mosalloc_platform::mock::take_events()
            .into_iter()
            .any(|event| {
                let addr = match event {
                    mosalloc_platform::mock::MapEvent::Map { addr, .. } => addr,
                    mosalloc_platform::mock::MapEvent::Unmap { addr, .. } => addr,
                };
                addr >= base && addr < base + max
            });
        assert!(!touched, "repeated resize re-touched region memory");
    }

    #[test]
    fn test_shrink_keeps_partial_huge_page() {
        let layout = layout_of(&[(0, 4 * MB, PageSize::Huge2Mb)]);
        let mut region = HugePageBackedRegion::new(4 * MB, &layout, None);
        assert_eq!(region.size(), 4 * MB);

        // shrinking into the middle of a 2MB page keeps that page whole
        let achieved = region.resize(2 * MB + 4 * KB).unwrap();
        assert_eq!(achieved, 4 * MB);

        // shrinking to a page boundary drops exactly the tail page
        let achieved = region.resize(2 * MB).unwrap();
        assert_eq!(achieved, 2 * MB);

        let achieved = region.resize(0).unwrap();
        assert_eq!(achieved, 0);
    }

    #[test]
    fn test_extend_rounds_to_interval_page_size() {
        let layout = layout_of(&[(0, 4 * MB, PageSize::Huge2Mb)]);
        let mut region = HugePageBackedRegion::new(8 * MB, &layout, None);
        region.resize(0).unwrap();

        // a 4KB request inside a 2MB interval materializes a whole 2MB page
        let achieved = region.resize(4 * KB).unwrap();
        assert_eq!(achieved, 2 * MB);

        // past the huge interval, base pages extend exactly
        let achieved = region.resize(4 * MB + 12 * KB).unwrap();
        assert_eq!(achieved, 4 * MB + 12 * KB);
    }

    #[test]
    fn test_brk_style_fixed_base() {
        // anchor well away from anything the test process uses
        let anchor = {
            let brk = mosalloc_platform::sys::current_brk() as u64;
            round_up(brk + GB, GB) as usize
        };
        let layout = layout_of(&[]);
        let mut region = HugePageBackedRegion::new(16 * MB, &layout, Some(anchor));
        assert_eq!(region.base(), anchor);

        unsafe {
            let base = region.base() as *mut u8;
            core::ptr::write_bytes(base, 0x5a, (16 * MB) as usize);
            assert_eq!(*base.add(123), 0x5a);
        }
        region.resize(0).unwrap();
    }

    #[test]
    fn test_materialization_uses_prescribed_page_sizes() {
        let _guard = EVENT_LOCK.lock().unwrap();
        mosalloc_platform::mock::clear_events();
        let layout = layout_of(&[
            (4 * MB, 8 * MB, PageSize::Huge2Mb),
            (GB, 2 * GB, PageSize::Huge1Gb),
        ]);
        let region = HugePageBackedRegion::new(2 * GB + 4 * MB, &layout, None);

        let base = region.base();
        let events = mosalloc_platform::mock::take_events();
        let maps: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                mosalloc_platform::mock::MapEvent::Map {
                    addr,
                    len,
                    page_size,
                    fixed: true,
                    ..
                } if *addr >= base && *addr < base + region.max_size() as usize => {
                    Some((*addr - base, *len, *page_size))
                }
                _ => None,
            })
            .collect();

        assert!(maps.contains(&(4 * MB as usize, 4 * MB as usize, PageSize::Huge2Mb)));
        assert!(maps.contains(&(GB as usize, GB as usize, PageSize::Huge1Gb)));
        // the head gap is base-paged
        assert!(maps.contains(&(0, 4 * MB as usize, PageSize::Base4Kb)));
    }
}
