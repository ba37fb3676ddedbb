//! Huge-page-backed memory pools for the mosalloc shim
//!
//! # Purpose
//! This crate owns everything between the interposed libc symbols and the
//! raw syscalls: the pool layout configuration, the contiguous
//! huge-page-backed regions that materialize it, and the first-fit address
//! allocator that parcels regions out to intercepted `mmap`/`brk` requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        mosalloc shim (hooks)            │
//! └──────────────┬──────────────────────────┘
//!                │
//! ┌──────────────▼──────────────────────────┐
//! │      PoolAllocator (this crate)         │
//! │  • anon-mmap pool   (FFA + HPBR)        │
//! │  • file-mmap pool   (FFA + HPBR)        │
//! │  • brk pool         (HPBR only)         │
//! └──────────────┬──────────────────────────┘
//!                │ raw syscalls
//! ┌──────────────▼──────────────────────────┐
//! │         mosalloc-platform               │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every long-lived data structure here (interval lists, the FFA node arena)
//! is backed by memory from the raw mmap path, so constructing or growing it
//! can never re-enter the allocator it serves.

mod arena;

pub mod allocator;
pub mod config;
pub mod ffa;
pub mod hpbr;
pub mod interval;
pub mod validator;

pub use allocator::{PoolAllocator, RESIZE_THRESHOLD};
pub use config::{EnvConfig, PoolKind, PoolLayout};
pub use ffa::FirstFitAllocator;
pub use hpbr::HugePageBackedRegion;
pub use interval::{MemoryInterval, MemoryIntervalList};
pub use validator::{validate, LayoutError};

use thiserror::Error;

/// Errors surfaced by pool operations after initialization.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// A region resize was requested past the region's fixed maximum.
    #[error("requested size {requested} exceeds region maximum {max}")]
    OutOfRange {
        /// Requested region size in bytes.
        requested: u64,
        /// The region's fixed maximum in bytes.
        max: u64,
    },

    /// A program-break move below the brk region base.
    #[error("program break below region base")]
    BreakBelowBase,

    /// A freed block was rejected by the first-fit allocator.
    #[error("free rejected: {0}")]
    Free(#[from] ffa::FreeError),

    /// The address belongs to none of the managed pools.
    #[error("address is not managed by any pool")]
    NotManaged,

    /// The kernel rejected an unmap of a file-backed range.
    #[error("kernel unmap failed")]
    UnmapFailed,
}

/// Result type for pool operations.
pub type Result<T> = core::result::Result<T, PoolError>;
