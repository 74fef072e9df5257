//! Retired pointers and the per-thread retired array (`SPEC_FULL.md` §4.3).

use core::cell::Cell;
use core::ptr;

use super::pool::{Pool, PoolBlock};
use crate::allocator::AllocatorHooks;
use crate::error::SmrError;
use crate::stats::Counters;

/// Capacity of a retired block, matching the "typical capacity 256" of
/// `spec.md` §3.
pub(crate) const RETIRED_BLOCK_CAPACITY: usize = 256;

/// A (pointer, deleter) pair. The deleter is a plain function pointer
/// receiving the untyped address; container code supplies a trampoline
/// that downcasts and destroys (`spec.md` §3, §9 "Polymorphism over
/// deleters").
#[derive(Clone, Copy)]
pub(crate) struct RetiredPtr {
    pub(crate) ptr: *mut (),
    pub(crate) deleter: unsafe fn(*mut ()),
}

/// A fixed-capacity block of retired pointers, chained by the owning
/// thread into a forward-only list (`spec.md` §3, §4.3).
pub(crate) struct RetiredBlock {
    cells: [Option<RetiredPtr>; RETIRED_BLOCK_CAPACITY],
    /// Next block in the chain. Only ever touched by the owning thread
    /// (or by `help_scan` after it has claimed an inactive record), so a
    /// plain `Cell` suffices.
    next: Cell<*mut RetiredBlock>,
}

impl PoolBlock for RetiredBlock {
    fn fresh() -> Self {
        Self {
            cells: core::array::from_fn(|_| None),
            next: Cell::new(ptr::null_mut()),
        }
    }
}

// SAFETY: `next` is only read/written by the block's single logical
// owner at any given time (owning thread, or help_scan after claiming).
unsafe impl Sync for RetiredBlock {}

/// Per-thread retired-pointer buffer: a chain of [`RetiredBlock`]s with a
/// current-block/current-cell cursor (`spec.md` §3, §4.3).
///
/// Invariant: at most one block has a non-full cursor; all earlier
/// blocks are full (`spec.md` §4.3).
pub(crate) struct RetiredArray {
    head: Cell<*mut RetiredBlock>,
    current_block: Cell<*mut RetiredBlock>,
    current_cell: Cell<usize>,
}

impl RetiredArray {
    pub(crate) fn new() -> Self {
        Self {
            head: Cell::new(ptr::null_mut()),
            current_block: Cell::new(ptr::null_mut()),
            current_cell: Cell::new(0),
        }
    }

    fn ensure_block(
        &self,
        pool: &Pool<RetiredBlock>,
        hooks: &AllocatorHooks,
        stats: &Counters,
    ) -> Result<(), SmrError> {
        if !self.current_block.get().is_null() {
            return Ok(());
        }
        let block = pool.get(hooks)?;
        self.head.set(block);
        self.current_block.set(block);
        self.current_cell.set(0);
        Counters::bump(&stats.retired_block_count);
        Ok(())
    }

    /// Push a retired pointer. Returns `Ok(false)` when the caller should
    /// trigger a `scan` before continuing (`spec.md` §4.3 "push").
    pub(crate) fn push(
        &self,
        retired: RetiredPtr,
        pool: &Pool<RetiredBlock>,
        hooks: &AllocatorHooks,
        stats: &Counters,
    ) -> Result<bool, SmrError> {
        self.ensure_block(pool, hooks, stats)?;

        let block = self.current_block.get();
        let cell = self.current_cell.get();

        // SAFETY: block is a live RetiredBlock owned by this array.
        let cells = unsafe { &mut (*block).cells };

        if cell < RETIRED_BLOCK_CAPACITY {
            cells[cell] = Some(retired);
            self.current_cell.set(cell + 1);
            return Ok(true);
        }

        // SAFETY: block is live; `next` is only mutated by the owner.
        let next = unsafe { (*block).next.get() };
        if next.is_null() {
            return Ok(false);
        }
        self.current_block.set(next);
        self.current_cell.set(0);
        self.push(retired, pool, hooks, stats)
    }

    /// Repush during `scan` compaction: identical to `push`, kept as a
    /// distinct name to mirror the design's intent (`spec.md` §4.3,
    /// §4.5 step 4).
    pub(crate) fn repush(
        &self,
        retired: RetiredPtr,
        pool: &Pool<RetiredBlock>,
        hooks: &AllocatorHooks,
        stats: &Counters,
    ) -> Result<bool, SmrError> {
        self.push(retired, pool, hooks, stats)
    }

    /// Allocate a fresh block and chain it as the new tail, called only
    /// from within `scan` (`spec.md` §4.3 "extend").
    pub(crate) fn extend(
        &self,
        pool: &Pool<RetiredBlock>,
        hooks: &AllocatorHooks,
        stats: &Counters,
    ) -> Result<(), SmrError> {
        let new_block = pool.get(hooks)?;
        let current = self.current_block.get();
        if current.is_null() {
            self.head.set(new_block);
        } else {
            // SAFETY: current is a live block owned by this array.
            unsafe { (*current).next.set(new_block) };
        }
        self.current_block.set(new_block);
        self.current_cell.set(0);
        Counters::bump(&stats.retired_block_count);
        Counters::bump(&stats.retired_extend_count);
        Ok(())
    }

    /// Drain every retired cell from `head` up to (excluding) the unused
    /// tail, calling `visit` on each. Used by both `scan` (to partition
    /// kept-vs-freed) and `help_scan` (to splice into another array).
    /// After this call the array is reset to empty (no blocks owned);
    /// the caller is responsible for returning blocks to `pool` once it
    /// is done reading their contents, via [`Self::take_blocks`].
    pub(crate) fn drain(&self, mut visit: impl FnMut(RetiredPtr)) {
        let mut block = self.head.get();
        let last_block = self.current_block.get();
        while !block.is_null() {
            // SAFETY: block is live and owned by this array until reset.
            let cells = unsafe { &mut (*block).cells };
            let limit = if block == last_block {
                self.current_cell.get()
            } else {
                RETIRED_BLOCK_CAPACITY
            };
            for cell in cells.iter_mut().take(limit) {
                if let Some(retired) = cell.take() {
                    visit(retired);
                }
            }
            block = if block == last_block {
                ptr::null_mut()
            } else {
                // SAFETY: block is live.
                unsafe { (*block).next.get() }
            };
        }
    }

    /// Reclaim every block owned by this array back to `pool`, leaving
    /// the array empty. Call after [`Self::drain`].
    pub(crate) fn release_blocks(&self, pool: &Pool<RetiredBlock>, hooks: &AllocatorHooks) {
        let mut block = self.head.get();
        while !block.is_null() {
            // SAFETY: block was allocated via `pool.get` and is not
            // shared with anything else.
            let next = unsafe { (*block).next.get() };
            unsafe { (*block).next.set(ptr::null_mut()) };
            pool.put(block, hooks);
            block = next;
        }
        self.head.set(ptr::null_mut());
        self.current_block.set(ptr::null_mut());
        self.current_cell.set(0);
    }

    /// Collect every still-live retired pointer without releasing
    /// blocks; used by tests and `help_scan` accounting.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<RetiredPtr> {
        let mut out = Vec::new();
        let mut block = self.head.get();
        let last_block = self.current_block.get();
        while !block.is_null() {
            let cells = unsafe { &(*block).cells };
            let limit = if block == last_block {
                self.current_cell.get()
            } else {
                RETIRED_BLOCK_CAPACITY
            };
            for cell in cells.iter().take(limit) {
                if let Some(r) = cell {
                    out.push(*r);
                }
            }
            block = if block == last_block {
                ptr::null_mut()
            } else {
                unsafe { (*block).next.get() }
            };
        }
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.get().is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn noop(_p: *mut ()) {}

    #[test]
    fn push_fills_block_then_reports_full() {
        let pool: Pool<RetiredBlock> = Pool::new();
        let hooks = AllocatorHooks::new();
        let stats = Counters::new();
        let array = RetiredArray::new();

        for i in 0..RETIRED_BLOCK_CAPACITY {
            let ok = array
                .push(
                    RetiredPtr {
                        ptr: i as *mut (),
                        deleter: noop,
                    },
                    &pool,
                    &hooks,
                    &stats,
                )
                .unwrap();
            assert!(ok);
        }

        let overflow = array
            .push(
                RetiredPtr {
                    ptr: ptr::null_mut(),
                    deleter: noop,
                },
                &pool,
                &hooks,
                &stats,
            )
            .unwrap();
        assert!(!overflow, "block is full; caller must scan before retrying");
    }

    #[test]
    fn drain_visits_everything_then_empties() {
        let pool: Pool<RetiredBlock> = Pool::new();
        let hooks = AllocatorHooks::new();
        let stats = Counters::new();
        let array = RetiredArray::new();

        for i in 1..=5 {
            array
                .push(
                    RetiredPtr {
                        ptr: i as *mut (),
                        deleter: noop,
                    },
                    &pool,
                    &hooks,
                    &stats,
                )
                .unwrap();
        }

        let mut seen = Vec::new();
        array.drain(|r| seen.push(r.ptr as usize));
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);

        array.release_blocks(&pool, &hooks);
        assert!(array.is_empty());
    }
}
