//! Per-thread hazard storage (`SPEC_FULL.md` §4.2).

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::guard_slot::{FreeList, GuardBlock, GuardSlot};
use super::pool::Pool;
use crate::allocator::AllocatorHooks;
use crate::error::SmrError;
use crate::stats::Counters;

/// Exclusively owned by one thread record. Holds the initial guard
/// array, the free-list of released slots spanning it and every
/// extension block, and the atomically-published extension chain head
/// (`spec.md` §3 "Thread hazard storage").
pub(crate) struct ThreadHazardStorage {
    initial: Box<[GuardSlot]>,
    /// Published with release ordering; scanners load it with acquire
    /// (`spec.md` §4.2 invariant).
    extension_head: AtomicPtr<GuardBlock>,
    free_list: FreeList,
}

impl ThreadHazardStorage {
    pub(crate) fn new(initial_hp_count: usize) -> Self {
        let initial: Box<[GuardSlot]> = (0..initial_hp_count.max(1))
            .map(|_| GuardSlot::new())
            .collect();
        let free_list = FreeList::new();
        for slot in initial.iter().rev() {
            free_list.push(slot as *const GuardSlot as *mut GuardSlot);
        }
        Self {
            initial,
            extension_head: AtomicPtr::new(ptr::null_mut()),
            free_list,
        }
    }

    /// Allocate one slot, extending the storage with a fresh guard block
    /// from `pool` if the free-list is empty (`spec.md` §4.2 "alloc()").
    pub(crate) fn alloc(
        &self,
        pool: &Pool<GuardBlock>,
        hooks: &AllocatorHooks,
        stats: &Counters,
    ) -> Result<*mut GuardSlot, SmrError> {
        if let Some(slot) = self.free_list.pop() {
            Counters::bump(&stats.guard_allocated);
            return Ok(slot);
        }
        self.extend(pool, hooks, stats)?;
        let slot = self
            .free_list
            .pop()
            .expect("extend() must make at least one slot available");
        Counters::bump(&stats.guard_allocated);
        Ok(slot)
    }

    /// Allocate `k` slots at once (`spec.md` §4.2 "alloc(array, K)").
    pub(crate) fn alloc_array(
        &self,
        k: usize,
        pool: &Pool<GuardBlock>,
        hooks: &AllocatorHooks,
        stats: &Counters,
    ) -> Result<Vec<*mut GuardSlot>, SmrError> {
        let mut slots = Vec::with_capacity(k);
        for _ in 0..k {
            slots.push(self.alloc(pool, hooks, stats)?);
        }
        Ok(slots)
    }

    /// Clear and free a single slot (`spec.md` §4.2 "free(slot)").
    pub(crate) fn free(&self, slot: *mut GuardSlot, stats: &Counters) {
        // SAFETY: slot was previously returned by `alloc` on this storage.
        unsafe { (*slot).clear() };
        self.free_list.push(slot);
        Counters::bump(&stats.guard_freed);
    }

    pub(crate) fn free_array(&self, slots: &[*mut GuardSlot], stats: &Counters) {
        for &slot in slots {
            self.free(slot, stats);
        }
    }

    fn extend(
        &self,
        pool: &Pool<GuardBlock>,
        hooks: &AllocatorHooks,
        stats: &Counters,
    ) -> Result<(), SmrError> {
        let block = pool.get(hooks)?;
        // SAFETY: block is freshly checked out and not yet published.
        self.free_list.extend_with_block(unsafe { &*block });

        let old_head = self.extension_head.load(Ordering::Relaxed);
        // SAFETY: block is live and not yet shared.
        unsafe { (*block).set_next(old_head) };
        // Publish with release ordering: scanners walk this chain with
        // an acquire load (`spec.md` §4.2, §5).
        self.extension_head.store(block, Ordering::Release);

        Counters::bump(&stats.hp_extend_count);
        Counters::bump(&stats.hp_block_count);
        Ok(())
    }

    /// Walk the initial array and every extension block, collecting
    /// non-null hazard values into `out` (`spec.md` §4.5 step 2).
    pub(crate) fn collect_hazards(&self, out: &mut Vec<*mut ()>) {
        for slot in self.initial.iter() {
            let v = slot.read_acquire();
            if !v.is_null() {
                out.push(v);
            }
        }
        let mut block = self.extension_head.load(Ordering::Acquire);
        while !block.is_null() {
            // SAFETY: block is a live GuardBlock linked into this chain.
            let b = unsafe { &*block };
            for slot in b.slots().iter() {
                let v = slot.read_acquire();
                if !v.is_null() {
                    out.push(v);
                }
            }
            block = b.next();
        }
    }

    /// Clear every slot and return extension blocks to `pool`
    /// (`spec.md` §4.2 "clear()"). Called on detach.
    pub(crate) fn clear(&self, pool: &Pool<GuardBlock>, hooks: &AllocatorHooks) {
        for slot in self.initial.iter() {
            slot.clear();
        }
        self.free_list.clear();
        for slot in self.initial.iter().rev() {
            self.free_list.push(slot as *const GuardSlot as *mut GuardSlot);
        }

        let mut block = self.extension_head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !block.is_null() {
            // SAFETY: block was allocated via `pool.get` and is not
            // shared with anything else.
            let next = unsafe { (*block).next() };
            unsafe { (*block).set_next(ptr::null_mut()) };
            pool.put(block, hooks);
            block = next;
        }
    }
}
