//! The Dynamic Hazard Pointer SMR runtime.
//!
//! This module owns the process-wide singleton (`spec.md` §4.4), the
//! per-thread bookkeeping it hands out, and the reclamation algorithms
//! (`scan`, `help_scan`) that make `retire` eventually free memory.
//! Container code (`crate::containers`) never touches these types
//! directly except through the [`Guard`] family re-exported here.

mod guard;
mod guard_slot;
mod hazard_storage;
mod pool;
mod retired;
mod thread_record;

pub use guard::{Guard, GuardArray, GuardedPtr};

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::boxed::Box;

use guard_slot::GuardBlock;
use pool::Pool;
use retired::{RetiredArray, RetiredBlock, RetiredPtr};
use thread_record::{ThreadRecord, ThreadRecordList};

use crate::allocator::{AllocFn, AllocatorHooks, FreeFn};
use crate::error::SmrError;
use crate::stats::{Counters, Stats};

/// Default initial hazard-pointer count, used when `construct` is never
/// called explicitly before the first `attach_thread` (a convenience for
/// container unit tests; `spec.md` leaves this unconstrained as long as
/// `construct` precedes `attach_thread`).
const DEFAULT_INITIAL_HP_COUNT: usize = 16;

struct Smr {
    constructed: AtomicBool,
    initial_hp_count: AtomicUsize,
    list: ThreadRecordList,
    guard_pool: Pool<GuardBlock>,
    retired_pool: Pool<RetiredBlock>,
    hooks: AllocatorHooks,
    stats: Counters,
    /// Scan-sizing hint (`spec.md` §4.4, §9 "Not guessed"). Read/written
    /// with `Relaxed` ordering; correctness never depends on its value,
    /// only on `Vec` growing past it when wrong.
    last_plist_size: AtomicUsize,
}

impl Smr {
    const fn new() -> Self {
        Self {
            constructed: AtomicBool::new(false),
            initial_hp_count: AtomicUsize::new(DEFAULT_INITIAL_HP_COUNT),
            list: ThreadRecordList::new(),
            guard_pool: Pool::new(),
            retired_pool: Pool::new(),
            hooks: AllocatorHooks::new(),
            stats: Counters::new(),
            last_plist_size: AtomicUsize::new(DEFAULT_INITIAL_HP_COUNT * 4),
        }
    }

    fn require_constructed(&self) -> Result<(), SmrError> {
        if self.constructed.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SmrError::NotInitialized.programmer_error())
        }
    }
}

static SMR: Smr = Smr::new();

thread_local! {
    static CURRENT_RECORD: Cell<*mut ThreadRecord> = const { Cell::new(ptr::null_mut()) };
}

/// Install the singleton, idempotently (`spec.md` §4.4 "construct").
///
/// A second call is a no-op: the design requires "only once" semantics,
/// not an error, so that library-internal and application-level callers
/// can both call it defensively.
pub fn construct(initial_hp_count: usize) {
    if SMR
        .constructed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
    {
        SMR.initial_hp_count
            .store(initial_hp_count.max(1), Ordering::Relaxed);
        SMR.hooks.freeze();
        log::debug!("DHP SMR constructed with initial_hp_count = {initial_hp_count}");
    }
}

/// Install a process-wide allocator pair. Must precede [`construct`]
/// (`spec.md` §5 "Allocator policy"). Returns `false` if the hooks were
/// already frozen.
pub fn set_memory_allocator(alloc_fn: AllocFn, free_fn: FreeFn) -> bool {
    SMR.hooks.install(alloc_fn, free_fn)
}

/// Tear down the singleton (`spec.md` §4.4 "destruct").
///
/// If `detach_all` is set, every still-active thread record is force
/// detached first. Every thread record's retired pointers are then
/// disposed of unconditionally (this is only safe because the caller's
/// precondition is that no thread is still issuing SMR operations) and
/// its memory freed. Returns a statistics snapshot taken before state is
/// cleared (`Smr::postmortem_statistics`).
pub fn destruct(detach_all: bool) -> Stats {
    if detach_all {
        SMR.list.for_each(|rec| {
            if rec.is_active() {
                rec.release();
            }
        });
    }

    let snapshot = SMR.stats.snapshot();

    let mut cur = SMR.list.take_for_destruct();
    while !cur.is_null() {
        // SAFETY: cur is a live ThreadRecord owned by the now-reset list.
        let boxed = unsafe { Box::from_raw(cur) };
        let next = boxed.next.load(Ordering::Relaxed);

        boxed.retired.drain(|r| {
            // SAFETY: r.ptr was retired with r.deleter as its trampoline.
            unsafe { (r.deleter)(r.ptr) };
            Counters::bump(&SMR.stats.free_count);
        });
        boxed.retired.release_blocks(&SMR.retired_pool, &SMR.hooks);
        boxed.hazards.clear(&SMR.guard_pool, &SMR.hooks);

        cur = next;
    }

    CURRENT_RECORD.with(|c| c.set(ptr::null_mut()));
    SMR.constructed.store(false, Ordering::Release);
    log::debug!("DHP SMR destructed");
    snapshot
}

/// Attach the current thread, reusing an inactive record if one exists
/// (`spec.md` §4.4 "attach_thread").
pub fn attach_thread() -> Result<(), SmrError> {
    SMR.require_constructed()?;

    if let Some(existing) = SMR.list.find_reusable() {
        CURRENT_RECORD.with(|c| c.set(existing));
        return Ok(());
    }

    let initial_hp_count = SMR.initial_hp_count.load(Ordering::Relaxed);
    let record = Box::into_raw(Box::new(ThreadRecord::new(initial_hp_count)));
    SMR.list.push_front(record);
    Counters::bump(&SMR.stats.thread_rec_count);
    CURRENT_RECORD.with(|c| c.set(record));
    Ok(())
}

/// Detach the current thread (`spec.md` §4.4 "detach_thread"): cooperate
/// via `help_scan`, run a final `scan` so nothing is stranded, clear the
/// hazard storage (returning extension blocks to the pool), then mark
/// the record inactive and reusable.
pub fn detach_thread() -> Result<(), SmrError> {
    let record_ptr = tls()?;
    // SAFETY: record_ptr came from tls(), which only returns live records.
    let record = unsafe { &*record_ptr };

    help_scan_record(record);
    scan_record(record);
    record.hazards.clear(&SMR.guard_pool, &SMR.hooks);
    record.release();

    CURRENT_RECORD.with(|c| c.set(ptr::null_mut()));
    Ok(())
}

/// The current thread's record, or `NotAttached` (`spec.md` §4.4 "tls()").
pub(crate) fn tls() -> Result<*mut ThreadRecord, SmrError> {
    SMR.require_constructed()?;
    let ptr = CURRENT_RECORD.with(|c| c.get());
    if ptr.is_null() {
        Err(SmrError::NotAttached.programmer_error())
    } else {
        Ok(ptr)
    }
}

pub(crate) fn guard_pool() -> &'static Pool<GuardBlock> {
    &SMR.guard_pool
}

pub(crate) fn allocator_hooks() -> &'static AllocatorHooks {
    &SMR.hooks
}

pub(crate) fn stats() -> &'static Counters {
    &SMR.stats
}

/// Enqueue `p` for reclamation with `deleter` as its trampoline
/// (`spec.md` §4.4 "retire", §6.1). Containers should prefer the typed
/// [`retire`] wrapper instead of calling this directly.
pub(crate) fn retire_raw(ptr_: *mut (), deleter: unsafe fn(*mut ())) -> Result<(), SmrError> {
    let record_ptr = tls()?;
    // SAFETY: record_ptr came from tls().
    let record = unsafe { &*record_ptr };
    let retired = RetiredPtr {
        ptr: ptr_,
        deleter,
    };

    Counters::bump(&SMR.stats.retired_count);

    if record
        .retired
        .push(retired, &SMR.retired_pool, &SMR.hooks, &SMR.stats)?
    {
        return Ok(());
    }

    scan_record(record);

    // `scan` either freed room or extended the array; this push cannot
    // legitimately fail again (`spec.md` §4.4 "retire").
    record
        .retired
        .push(retired, &SMR.retired_pool, &SMR.hooks, &SMR.stats)
        .map(|_| ())
}

/// Typed retirement: builds the downcast-and-drop trampoline for `T`.
///
/// # Safety
///
/// `p` must be a unique, currently-reachable-from-no-live-path pointer
/// previously produced by `Box::into_raw::<T>`.
pub unsafe fn retire<T>(p: *mut T) -> Result<(), SmrError> {
    unsafe fn drop_trampoline<T>(p: *mut ()) {
        // SAFETY: contract of `retire`.
        drop(unsafe { Box::from_raw(p as *mut T) });
    }
    match retire_raw(p as *mut (), drop_trampoline::<T>) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Container operations never expose SMR errors; per
            // `spec.md` §7 the node is leaked rather than risk double
            // handling, and the failure is logged for diagnosability.
            log::warn!("retire failed ({e}); leaking node to avoid corrupting SMR state");
            Err(e)
        }
    }
}

/// Opportunistic reclamation for the current thread (`spec.md` §4.5).
pub fn scan() -> Result<(), SmrError> {
    let record_ptr = tls()?;
    // SAFETY: record_ptr came from tls().
    scan_record(unsafe { &*record_ptr });
    Ok(())
}

/// Cooperative reclamation of detached threads' retired arrays
/// (`spec.md` §4.6).
pub fn help_scan() -> Result<(), SmrError> {
    let record_ptr = tls()?;
    // SAFETY: record_ptr came from tls().
    help_scan_record(unsafe { &*record_ptr });
    Ok(())
}

/// Force-dispose every retired pointer of the current thread regardless
/// of hazard protection (`spec.md` §6.1 "force_dispose"). Safe only when
/// the caller knows no other thread still holds a hazard on any of
/// them — e.g. because the guards that would have held one were already
/// dropped, as in the single-thread round-trip scenario (`spec.md` §8.1).
pub fn force_dispose() -> Result<(), SmrError> {
    let record_ptr = tls()?;
    // SAFETY: record_ptr came from tls().
    let record = unsafe { &*record_ptr };
    record.retired.drain(|r| {
        // SAFETY: r.ptr was retired with r.deleter as its trampoline.
        unsafe { (r.deleter)(r.ptr) };
        Counters::bump(&SMR.stats.free_count);
    });
    record.retired.release_blocks(&SMR.retired_pool, &SMR.hooks);
    Ok(())
}

/// Snapshot of every counter (`spec.md` §6.1 "statistics").
pub fn statistics() -> Stats {
    SMR.stats.snapshot()
}

/// Identical to [`statistics`]; exists as a distinct name so callers that
/// specifically want a post-teardown view read naturally. `destruct`
/// already returns the authoritative pre-clear snapshot.
pub fn postmortem_statistics() -> Stats {
    SMR.stats.snapshot()
}

fn repush_with_extend(
    record: &ThreadRecord,
    r: RetiredPtr,
    pool: &Pool<RetiredBlock>,
    hooks: &AllocatorHooks,
    stats: &Counters,
) -> Result<(), SmrError> {
    loop {
        if record.retired.repush(r, pool, hooks, stats)? {
            return Ok(());
        }
        record.retired.extend(pool, hooks, stats)?;
    }
}

fn scan_record(record: &ThreadRecord) {
    // Phase 1: the acquire load inside `list.head()`/`for_each` below
    // establishes the happens-before edge from every thread's `sync`
    // RMW to this walk (`spec.md` §4.5 step 1, §5).
    let hint = SMR.last_plist_size.load(Ordering::Relaxed);
    let mut plist: std::vec::Vec<*mut ()> = std::vec::Vec::with_capacity(hint);

    SMR.list.for_each(|rec| {
        if rec.is_active() {
            rec.hazards.collect_hazards(&mut plist);
        }
    });

    // Phase 3: sort for O(log n) membership testing.
    plist.sort_unstable();
    SMR.last_plist_size.store(plist.len().max(1), Ordering::Relaxed);
    Counters::bump(&SMR.stats.scan_count);

    // Phase 4: partition the retired array into kept vs freed.
    let mut kept = std::vec::Vec::new();
    let mut freed_any = false;
    record.retired.drain(|r| {
        if plist.binary_search(&r.ptr).is_ok() {
            kept.push(r);
        } else {
            // SAFETY: r.ptr was retired with r.deleter as its trampoline,
            // and it is not present in any thread's hazard snapshot.
            unsafe { (r.deleter)(r.ptr) };
            Counters::bump(&SMR.stats.free_count);
            freed_any = true;
        }
    });
    record.retired.release_blocks(&SMR.retired_pool, &SMR.hooks);

    for r in kept {
        if repush_with_extend(record, r, &SMR.retired_pool, &SMR.hooks, &SMR.stats).is_err() {
            log::warn!("scan: failed to re-enqueue a still-hazardous retired pointer");
        }
    }

    // Phase 5: if scan made no progress, pre-extend so the next retire
    // is guaranteed to succeed without needing another scan
    // (`spec.md` §4.5 step 5).
    if !freed_any {
        let _ = record.retired.extend(&SMR.retired_pool, &SMR.hooks, &SMR.stats);
    }
}

fn help_scan_record(record: &ThreadRecord) {
    Counters::bump(&SMR.stats.help_scan_count);
    SMR.list.for_each(|rec| {
        if core::ptr::eq(rec, record) {
            return;
        }
        if !rec.is_active() && rec.try_claim() {
            rec.retired.drain(|r| {
                if repush_with_extend(record, r, &SMR.retired_pool, &SMR.hooks, &SMR.stats)
                    .is_err()
                {
                    log::warn!("help_scan: failed to migrate a retired pointer");
                }
            });
            rec.retired.release_blocks(&SMR.retired_pool, &SMR.hooks);
            rec.release();
        }
    });
}
