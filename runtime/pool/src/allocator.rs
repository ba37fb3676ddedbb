//! The pool allocator: three pools behind one dispatch surface.
//!
//! One instance owns the anon-mmap, file-mmap and brk pools. The mmap pools
//! pair a first-fit address allocator with a huge-page-backed region; the brk
//! pool is a region alone, since the program break moves monotonically and
//! needs no address recycling.
//!
//! Each pool is guarded by its own lock and no operation ever takes two of
//! them, so there is no lock ordering to get wrong. Address-range membership
//! checks read fixed spans recorded at construction and take no lock at all
//! (`mprotect` interposition runs on them).

use core::ffi::c_void;

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use spin::Mutex;

use mosalloc_platform::{fatal, sys};

use crate::config::{EnvConfig, PoolKind, PoolLayout};
use crate::ffa::FirstFitAllocator;
use crate::hpbr::HugePageBackedRegion;
use crate::validator::validate;
use crate::{config::ConfigError, PoolError, Result};

/// How far the live top may fall below the materialized size before a free
/// shrinks the region.
pub const RESIZE_THRESHOLD: u64 = 2 * 1024 * 1024;

/// One pool: a region plus, for the mmap pools, its address allocator.
struct Pool {
    hpbr: HugePageBackedRegion,
    ffa: Option<FirstFitAllocator>,
    max_observed: u64,
}

impl Pool {
    /// Live allocation top as an offset from the region base.
    fn live_top(&self) -> u64 {
        match &self.ffa {
            Some(ffa) => (ffa.top_address() - self.hpbr.base()) as u64,
            None => self.hpbr.size(),
        }
    }

    /// Shrink the region down to the live top once the gap passes the
    /// threshold. Memory stays materialized below the threshold to avoid
    /// map/unmap churn on busy free/allocate cycles.
    fn shrink_to_live_top(&mut self) -> Result<()> {
        let top = self.live_top();
        if top < self.hpbr.size() && self.hpbr.size() - top > RESIZE_THRESHOLD {
            self.hpbr.resize(top)?;
        }
        Ok(())
    }

    fn note_observed(&mut self, size: u64) {
        if self.max_observed < size {
            self.max_observed = size;
        }
    }
}

/// Address range owned by a pool, fixed at construction.
#[derive(Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// The three pools and their dispatch logic.
pub struct PoolAllocator {
    anon: Mutex<Pool>,
    file: Mutex<Pool>,
    brk: Mutex<Pool>,

    anon_span: Span,
    file_span: Span,
    brk_span: Span,

    analyze: bool,
}

impl PoolAllocator {
    /// Build all three pools from the layout file named by `config`.
    ///
    /// The brk pool is pinned at `brk_region_base` (the rounded-up program
    /// break); the mmap pools land wherever the kernel puts them. All regions
    /// start dematerialized. With analysis enabled, the pools' base pointers
    /// are appended to `pools_base_pointers.out`.
    pub fn new(config: &EnvConfig, brk_region_base: usize) -> core::result::Result<Self, ConfigError> {
        let anon_layout = PoolLayout::from_csv(&config.layout_file, PoolKind::AnonMmap)?;
        validate(&anon_layout.intervals)?;
        let anon_hpbr = HugePageBackedRegion::new(anon_layout.size, &anon_layout.intervals, None);
        let anon_ffa = FirstFitAllocator::new(
            config.anon_ffa_capacity,
            anon_hpbr.base(),
            anon_hpbr.base() + anon_layout.size as usize,
        );

        let file_layout = PoolLayout::from_csv(&config.layout_file, PoolKind::FileMmap)?;
        validate(&file_layout.intervals)?;
        let file_hpbr = HugePageBackedRegion::new(file_layout.size, &file_layout.intervals, None);
        let file_ffa = FirstFitAllocator::new(
            config.file_ffa_capacity,
            file_hpbr.base(),
            file_hpbr.base() + file_layout.size as usize,
        );

        let brk_layout = PoolLayout::from_csv(&config.layout_file, PoolKind::Brk)?;
        validate(&brk_layout.intervals)?;
        let brk_hpbr =
            HugePageBackedRegion::new(brk_layout.size, &brk_layout.intervals, Some(brk_region_base));

        let mut anon = Pool {
            hpbr: anon_hpbr,
            ffa: Some(anon_ffa),
            max_observed: 0,
        };
        let mut file = Pool {
            hpbr: file_hpbr,
            ffa: Some(file_ffa),
            max_observed: 0,
        };
        let mut brk = Pool {
            hpbr: brk_hpbr,
            ffa: None,
            max_observed: 0,
        };

        // regions materialize on demand; shrinking to zero cannot fail
        for pool in [&mut anon, &mut file, &mut brk] {
            let _ = pool.hpbr.resize(0);
        }

        let allocator = Self {
            anon_span: Span {
                start: anon.hpbr.base(),
                end: anon.hpbr.base() + anon_layout.size as usize,
            },
            file_span: Span {
                start: file.hpbr.base(),
                end: file.hpbr.base() + file_layout.size as usize,
            },
            brk_span: Span {
                start: brk.hpbr.base(),
                end: brk.hpbr.base() + brk.hpbr.max_size() as usize,
            },
            anon: Mutex::new(anon),
            file: Mutex::new(file),
            brk: Mutex::new(brk),
            analyze: config.analyze_pools,
        };

        if allocator.analyze {
            allocator.write_base_pointers();
        }

        Ok(allocator)
    }

    /// Serve an anonymous mmap of `length` bytes from the anon pool.
    ///
    /// Pool exhaustion is unrecoverable: the interposer has nowhere else to
    /// place the mapping.
    pub fn allocate_anon(&self, length: usize) -> *mut u8 {
        let mut pool = self.anon.lock();

        let ptr = match pool.ffa.as_mut().and_then(|ffa| ffa.allocate(length)) {
            Some(ptr) => ptr,
            None => fatal("anonymous mmap pool is out of memory"),
        };

        let mapped_top = pool.hpbr.base() as u64 + pool.hpbr.size();
        let alloc_top = ptr as u64 + length as u64;
        if alloc_top > mapped_top {
            let new_size = alloc_top - pool.hpbr.base() as u64;
            if pool.hpbr.resize(new_size).is_err() {
                fatal("anonymous mmap pool cannot grow past its maximum");
            }
        }
        let size = pool.hpbr.size();
        pool.note_observed(size);

        ptr
    }

    /// Serve a file-backed mmap from the file pool.
    ///
    /// With a null `addr` the file FFA picks the placement; the file is then
    /// mapped there with `MAP_FIXED` over the pool's address range. The
    /// region is not resized here: the mapping is backed by the file, not by
    /// the pool's anonymous pages.
    ///
    /// # Safety
    /// Forwards the caller's `mmap` arguments to the kernel; the caller gets
    /// whatever contract the syscall gives.
    pub unsafe fn allocate_file(
        &self,
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: libc::off_t,
    ) -> *mut c_void {
        let mut pool = self.file.lock();

        let placement = if addr.is_null() {
            match pool.ffa.as_mut().and_then(|ffa| ffa.allocate(length)) {
                Some(ptr) => ptr.cast(),
                None => fatal("file mmap pool is out of memory"),
            }
        } else {
            addr
        };

        let top = pool.live_top();
        pool.note_observed(top);

        sys::mmap(placement, length, prot, libc::MAP_FIXED | flags, fd, offset)
    }

    /// Return an intercepted `munmap` range to whichever mmap pool owns it.
    pub fn deallocate_mmap(&self, addr: *mut u8, length: usize) -> Result<()> {
        if self.anon_span.contains(addr as usize) {
            let mut pool = self.anon.lock();
            match pool.ffa.as_mut() {
                Some(ffa) => ffa.free(addr, length)?,
                None => return Err(PoolError::NotManaged),
            }
            pool.shrink_to_live_top()?;
            return Ok(());
        }

        if self.file_span.contains(addr as usize) {
            let mut pool = self.file.lock();
            match pool.ffa.as_mut() {
                Some(ffa) => ffa.free(addr, length)?,
                None => return Err(PoolError::NotManaged),
            }
            pool.shrink_to_live_top()?;
            // drop the file pages themselves
            if unsafe { sys::munmap(addr.cast(), length) } != 0 {
                return Err(PoolError::UnmapFailed);
            }
            return Ok(());
        }

        Err(PoolError::NotManaged)
    }

    /// Move the program break to `addr` (absolute).
    pub fn change_program_break(&self, addr: usize) -> Result<()> {
        let mut pool = self.brk.lock();

        let base = pool.hpbr.base();
        if addr < base {
            return Err(PoolError::BreakBelowBase);
        }
        pool.hpbr.resize((addr - base) as u64)?;
        let size = pool.hpbr.size();
        pool.note_observed(size);
        Ok(())
    }

    /// Base address of the brk pool's region.
    pub fn brk_region_base(&self) -> usize {
        self.brk_span.start
    }

    /// Whether `addr` falls inside any managed pool. Lock-free: spans are
    /// fixed at construction.
    pub fn contains_huge_region(&self, addr: usize) -> bool {
        self.anon_span.contains(addr)
            || self.file_span.contains(addr)
            || self.brk_span.contains(addr)
    }

    /// Whether the exit-time analysis report is enabled.
    pub fn analyze_enabled(&self) -> bool {
        self.analyze
    }

    /// Write the exit-time report of each pool's maximum observed size.
    ///
    /// File name: `mosalloc_hpbrs_sizes.<pid>.csv`.
    pub fn write_analysis(&self) {
        if !self.analyze {
            return;
        }
        let name = format!("mosalloc_hpbrs_sizes.{}.csv", std::process::id());
        let Ok(mut out) = OpenOptions::new().write(true).create(true).truncate(true).open(&name)
        else {
            log::error!("cannot write pool analysis file {name}");
            return;
        };
        let brk = self.brk.lock().max_observed;
        let anon = self.anon.lock().max_observed;
        let file = self.file.lock().max_observed;
        let _ = writeln!(out, "region,max-size");
        let _ = writeln!(out, "brk,{brk}");
        let _ = writeln!(out, "anon-mmap,{anon}");
        let _ = writeln!(out, "file-mmap,{file}");
    }

    /// Append this process's pool base pointers to `pools_base_pointers.out`,
    /// writing the header first when the file is empty.
    fn write_base_pointers(&self) {
        let Ok(mut out) = OpenOptions::new()
            .append(true)
            .create(true)
            .open("pools_base_pointers.out")
        else {
            log::error!("cannot write pools_base_pointers.out");
            return;
        };
        if matches!(out.seek(SeekFrom::End(0)), Ok(0)) {
            let _ = writeln!(
                out,
                "pid,tid,anon-mmap-start,anon-mmap-end,brk-start,brk-end,file-mmap-start,file-mmap-end"
            );
        }
        let _ = writeln!(
            out,
            "{},{},{:#x},{:#x},{:#x},{:#x},{:#x},{:#x}",
            std::process::id(),
            sys::gettid(),
            self.anon_span.start,
            self.anon_span.end,
            self.brk_span.start,
            self.brk_span.end,
            self.file_span.start,
            self.file_span.end,
        );
    }
}
