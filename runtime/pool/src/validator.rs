//! Layout validation for pool interval lists.
//!
//! A pool layout only names its huge-page intervals; the 4KB gaps are
//! implicit. Validation guarantees that once the region base is aligned for
//! the largest page size, every huge interval lands on a boundary of its own
//! page size.

use mosalloc_platform::PageSize;
use thiserror::Error;

use crate::interval::{MemoryInterval, MemoryIntervalList};

/// Rule violations detected in a pool layout.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// An interval is not backed by a huge page size.
    #[error("interval page size must be 2MB or 1GB")]
    InvalidPageSize,

    /// A 1GB interval starts off the base-page grid.
    #[error("1GB interval start offset is not 4KB aligned")]
    Unaligned1GbStart,

    /// A 2MB interval starts off the base-page grid.
    #[error("2MB interval start offset is not 4KB aligned")]
    Unaligned2MbStart,

    /// A 1GB interval is empty or not a whole number of 1GB pages.
    #[error("1GB interval size is not a positive multiple of 1GB")]
    BadSize1Gb,

    /// A 2MB interval is empty or not a whole number of 2MB pages.
    #[error("2MB interval size is not a positive multiple of 2MB")]
    BadSize2Mb,

    /// The gap between two 1GB intervals breaks 1GB alignment.
    #[error("gap between 1GB intervals is not a multiple of 1GB")]
    UnalignedGap1Gb,

    /// The gap between two 2MB intervals breaks 2MB alignment.
    #[error("gap between 2MB intervals is not a multiple of 2MB")]
    UnalignedGap2Mb,

    /// The first 1GB and first 2MB intervals disagree on the 2MB grid.
    #[error("offset between the first 1GB and first 2MB intervals is not a multiple of 2MB")]
    UnalignedCrossGap,

    /// Two intervals cover overlapping byte ranges.
    #[error("intervals overlap")]
    OverlappingIntervals,
}

/// Check a pool layout against the alignment rules.
///
/// The rules, in the order they are checked:
/// 1. every interval is backed by 2MB or 1GB pages;
/// 2. intervals are pairwise disjoint;
/// 3. within each page size: starts are 4KB aligned, sizes are positive
///    multiples of the page size, and gaps between consecutive intervals are
///    multiples of the page size;
/// 4. the distance between the first 1GB and the first 2MB interval is a
///    multiple of 2MB.
pub fn validate(list: &MemoryIntervalList) -> Result<(), LayoutError> {
    let mut ones: Vec<MemoryInterval> = Vec::new();
    let mut twos: Vec<MemoryInterval> = Vec::new();
    for iv in list.iter() {
        match iv.page_size {
            PageSize::Huge1Gb => ones.push(*iv),
            PageSize::Huge2Mb => twos.push(*iv),
            PageSize::Base4Kb => return Err(LayoutError::InvalidPageSize),
        }
    }

    let mut all: Vec<MemoryInterval> = list.iter().copied().collect();
    all.sort_unstable_by_key(|iv| iv.start);
    for pair in all.windows(2) {
        if pair[1].start < pair[0].end {
            return Err(LayoutError::OverlappingIntervals);
        }
    }

    validate_same_size(&mut ones, PageSize::Huge1Gb)?;
    validate_same_size(&mut twos, PageSize::Huge2Mb)?;

    if let (Some(first_1gb), Some(first_2mb)) = (ones.first(), twos.first()) {
        let distance = first_1gb.start.abs_diff(first_2mb.start);
        if !PageSize::Huge2Mb.is_aligned(distance) {
            return Err(LayoutError::UnalignedCrossGap);
        }
    }

    Ok(())
}

fn validate_same_size(
    intervals: &mut [MemoryInterval],
    page_size: PageSize,
) -> Result<(), LayoutError> {
    intervals.sort_unstable_by_key(|iv| iv.start);

    for (i, iv) in intervals.iter().enumerate() {
        if !PageSize::Base4Kb.is_aligned(iv.start) {
            return Err(match page_size {
                PageSize::Huge1Gb => LayoutError::Unaligned1GbStart,
                _ => LayoutError::Unaligned2MbStart,
            });
        }
        if iv.is_empty() || !page_size.is_aligned(iv.len()) {
            return Err(match page_size {
                PageSize::Huge1Gb => LayoutError::BadSize1Gb,
                _ => LayoutError::BadSize2Mb,
            });
        }
        if i > 0 {
            let gap = iv.start - intervals[i - 1].end;
            if !page_size.is_aligned(gap) {
                return Err(match page_size {
                    PageSize::Huge1Gb => LayoutError::UnalignedGap1Gb,
                    _ => LayoutError::UnalignedGap2Mb,
                });
            }
        }
    }
    Ok(())
}
