//! Mosalloc - memory-syscall interposition for huge-page-backed pools
//!
//! # Purpose
//! Loaded with `LD_PRELOAD`, this library exports the process symbols
//! `mmap`, `munmap`, `mprotect`, `brk`, `sbrk` and `morecore`, and serves
//! them from pre-reserved contiguous pools whose sub-ranges are backed by a
//! caller-specified mix of 4KB, 2MB and 1GB hardware pages. An unmodified
//! application then runs with a precise, reproducible page-size layout, which
//! is what lets experimenters measure address-translation behavior.
//!
//! # Architecture
//!
//! ```text
//! application ──PLT──▶ mmap/munmap/brk/sbrk (this crate)
//!                          │ RUNNING?
//!                 no ──────┼────────── yes
//!                  ▼       ▼
//!            raw syscall  PoolAllocator (mosalloc-pool)
//! ```
//!
//! # Bootstrap
//! The process context is built lazily by the first hook to arrive and is
//! reached through an atomic lifecycle gate: the flag is flipped with release
//! ordering only after all three pools are built and is read with acquire
//! ordering on every hook entry. Calls landing while construction is in
//! flight (the loader's dlsym internals allocate, other threads race in) see
//! the closed gate and fall through to raw syscalls. A missing or invalid
//! `HPC_*` configuration is fatal: the process cannot sensibly run
//! half-interposed.

mod context;
pub mod hooks;
mod logging;

/// Initialize the interposer now instead of waiting for the first
/// intercepted call.
///
/// Reads the `HPC_*` environment, builds the pools and starts serving from
/// them. Safe to call more than once; only the first call does work. Missing
/// or invalid configuration is reported on stderr and terminates the
/// process.
pub fn init() {
    context::initialize();
}

extern "C" fn teardown_on_unload() {
    context::teardown();
}

// Registered directly in the ELF fini array: no dynamic-linker lookup is
// involved in reaching it.
#[used]
#[link_section = ".fini_array"]
static MOSALLOC_FINI: extern "C" fn() = teardown_on_unload;
