//! Process-lifetime interposer state.
//!
//! One context exists per process: the pool allocator plus the sbrk cursor.
//! It is reached through a lifecycle gate (`UNINITIALIZED → INITIALIZING →
//! RUNNING → TORN_DOWN`); hooks that find the gate closed fall through to raw
//! syscalls, which is what keeps the loader's early allocations safe.

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spin::{Mutex, Once};

use mosalloc_platform::{fatal, round_up, set_errno, sys, PageSize};
use mosalloc_pool::config::EnvConfig;
use mosalloc_pool::PoolAllocator;

use crate::logging;

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const RUNNING: u8 = 2;
const TORN_DOWN: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(UNINITIALIZED);
static CONTEXT: Once<Context> = Once::new();

/// Set by the exported `morecore` to prove that the downstream allocator now
/// asks us for memory; observed by the startup drain.
static MORECORE_SEEN: AtomicBool = AtomicBool::new(false);

/// How many doubling mallocs the drain will try before giving up.
const DRAIN_ROUNDS: usize = 48;

/// Everything the hooks need after initialization.
pub(crate) struct Context {
    allocator: PoolAllocator,
    /// Running program-break cursor for `sbrk`; 0 until the first call.
    brk_top: Mutex<usize>,
}

impl Context {
    #[inline]
    pub(crate) fn allocator(&self) -> &PoolAllocator {
        &self.allocator
    }

    /// `sbrk` over the brk pool: move the cursor by `increment` and return
    /// its previous value, or `-1` with errno `ENOMEM`.
    pub(crate) fn sbrk(&self, increment: isize) -> *mut c_void {
        let mut top = self.brk_top.lock();
        if *top == 0 {
            *top = self.allocator.brk_region_base();
        }

        let previous = *top;
        let requested = match (previous as isize).checked_add(increment) {
            Some(value) if value >= 0 => value as usize,
            _ => {
                set_errno(libc::ENOMEM);
                return usize::MAX as *mut c_void;
            }
        };

        if self.allocator.change_program_break(requested).is_err() {
            set_errno(libc::ENOMEM);
            return usize::MAX as *mut c_void;
        }

        *top = requested;
        previous as *mut c_void
    }
}

/// The context, if the interposer is up. Acquire pairs with the release
/// store in [`initialize`].
#[inline]
pub(crate) fn get() -> Option<&'static Context> {
    if STATE.load(Ordering::Acquire) != RUNNING {
        return None;
    }
    CONTEXT.get()
}

/// The context, building it on first use.
///
/// The first hook to arrive in a fresh process constructs the pools; hits
/// that land while construction is in flight (the loader's own allocations,
/// other threads) see the closed gate and fall through to raw syscalls. After
/// teardown nothing is rebuilt.
pub(crate) fn get_or_init() -> Option<&'static Context> {
    if STATE.load(Ordering::Acquire) == UNINITIALIZED {
        initialize();
    }
    get()
}

/// Record that the downstream allocator called `morecore`.
pub(crate) fn note_morecore() {
    MORECORE_SEEN.store(true, Ordering::Relaxed);
}

/// Build the pools and open the gate. First caller wins; reentry during
/// initialization falls through like everyone else.
pub(crate) fn initialize() {
    if STATE
        .compare_exchange(
            UNINITIALIZED,
            INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return;
    }

    let config = match EnvConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            logging::install(0);
            log::error!("configuration rejected: {error}");
            fatal("invalid pool configuration");
        }
    };

    logging::install(config.verbose_level);

    // anchor the brk pool well above the real program break
    let brk_region_base = round_up(sys::current_brk() as u64, PageSize::Huge1Gb.bytes()) as usize;

    let allocator = match PoolAllocator::new(&config, brk_region_base) {
        Ok(allocator) => allocator,
        Err(error) => {
            log::error!("pool construction failed: {error}");
            fatal("invalid pool configuration");
        }
    };

    let context = CONTEXT.call_once(|| Context {
        allocator,
        brk_top: Mutex::new(0),
    });
    STATE.store(RUNNING, Ordering::Release);
    log::info!("interposer running, brk pool anchored at {brk_region_base:#x}");

    configure_downstream_allocator();
    drain_downstream_allocator(&context.allocator);
}

/// Write the analysis report and close the gate. Pool memory is deliberately
/// left mapped: other objects still hold pointers into it while the process
/// unwinds.
pub(crate) fn teardown() {
    if STATE.load(Ordering::Acquire) != RUNNING {
        return;
    }
    if let Some(context) = CONTEXT.get() {
        context.allocator.write_analysis();
    }
    STATE.store(TORN_DOWN, Ordering::Release);
}

/// Point the downstream malloc at the brk pool: no mmap fallback, no
/// trimming, a single arena, and our `morecore` as its grow hook.
fn configure_downstream_allocator() {
    unsafe {
        libc::mallopt(libc::M_MMAP_MAX, 0);
        libc::mallopt(libc::M_TRIM_THRESHOLD, -1);
        libc::mallopt(libc::M_TOP_PAD, 0);
        libc::mallopt(libc::M_ARENA_MAX, 1);
    }
}

/// Malloc doubling sizes until one request reaches `morecore`, proving that
/// the allocator's pre-pool free lists are exhausted and future allocations
/// come from the managed pools.
///
/// The drained blocks are freed only when the drain did end in `morecore`;
/// the final block (the one the pool served) is retained so the allocator
/// does not just put it back on the old free list.
///
/// When the downstream allocator is not wired to `morecore` its requests are
/// served by the real program break, which sits below the (still
/// dematerialized) brk pool. The size cap keeps the drain from ever walking
/// the real break up into the pool's address range.
fn drain_downstream_allocator(allocator: &PoolAllocator) {
    let mut held = [core::ptr::null_mut::<c_void>(); DRAIN_ROUNDS];
    let mut count = 0;
    let mut size = 64usize;

    let break_room = allocator
        .brk_region_base()
        .saturating_sub(sys::current_brk() as usize);

    MORECORE_SEEN.store(false, Ordering::Relaxed);
    while count < DRAIN_ROUNDS && !MORECORE_SEEN.load(Ordering::Relaxed) {
        if size >= break_room / 4 {
            break;
        }
        let ptr = unsafe { libc::malloc(size) };
        if ptr.is_null() {
            break;
        }
        held[count] = ptr;
        count += 1;
        size = size.saturating_mul(2);
    }

    if MORECORE_SEEN.load(Ordering::Relaxed) && count > 0 {
        log::debug!("drained {count} allocations into the pools");
        for ptr in &held[..count - 1] {
            unsafe { libc::free(*ptr) };
        }
    }
}
