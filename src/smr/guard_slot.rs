//! Guard slots and guard blocks (`SPEC_FULL.md` §4.1).
//!
//! A guard slot is the atomic cell a reader stores a protected address
//! into. A guard block is a fixed-size array of slots that chains onto a
//! thread's extension list so its hazard-pointer capacity can grow.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Number of slots per guard block, chosen in the 16-64 range the
/// original design suggests (`spec.md` §3 "Guard block").
pub(crate) const GUARD_BLOCK_CAPACITY: usize = 32;

/// A single hazard-pointer slot.
///
/// Invariant (`spec.md` §3): at any instant the slot holds either a
/// cleared/null value, a pointer currently protected by the owning
/// thread, or — while on the owning thread's free-list — nothing in
/// `hazard` (it stays null) while `free_next` carries the free-list link.
/// The two states never overlap because a slot only has a meaningful
/// `free_next` while not handed out, and handing it out always clears
/// `free_next`'s relevance.
#[repr(C)]
pub(crate) struct GuardSlot {
    hazard: AtomicPtr<()>,
    /// Free-list link. Touched only by the owning thread; never raced
    /// against a concurrent scan, which reads `hazard` only.
    free_next: Cell<*mut GuardSlot>,
}

// SAFETY: `free_next` is only ever read or written by the thread that
// owns the enclosing `GuardBlock`; `hazard` is a plain atomic and safe
// to share.
unsafe impl Sync for GuardSlot {}

impl GuardSlot {
    pub(crate) const fn new() -> Self {
        Self {
            hazard: AtomicPtr::new(ptr::null_mut()),
            free_next: Cell::new(ptr::null_mut()),
        }
    }

    /// Store `p` with only a relaxed store; the caller is responsible
    /// for following up with the thread's `sync` RMW, which is what
    /// actually establishes the happens-before edge a scanner relies on
    /// (`spec.md` §4.1, §5).
    #[inline]
    pub(crate) fn set_relaxed(&self, p: *mut ()) {
        self.hazard.store(p, Ordering::Relaxed);
    }

    /// Clear with release ordering (`spec.md` §4.1 "clear").
    #[inline]
    pub(crate) fn clear(&self) {
        self.hazard.store(ptr::null_mut(), Ordering::Release);
    }

    /// Acquire-ordered read, used by a scanner observing another
    /// thread's slot (`spec.md` §4.1 "read").
    #[inline]
    pub(crate) fn read_acquire(&self) -> *mut () {
        self.hazard.load(Ordering::Acquire)
    }

    /// Relaxed read of the slot, used by the owning thread itself (e.g.
    /// `Guard::get`).
    #[inline]
    pub(crate) fn read_relaxed(&self) -> *mut () {
        self.hazard.load(Ordering::Relaxed)
    }

    #[inline]
    fn free_next(&self) -> *mut GuardSlot {
        self.free_next.get()
    }

    #[inline]
    fn set_free_next(&self, next: *mut GuardSlot) {
        self.free_next.set(next);
    }
}

/// A fixed-size array of guard slots, chained into a per-thread extension
/// list (`spec.md` §3 "Guard block").
#[repr(C)]
pub(crate) struct GuardBlock {
    slots: [GuardSlot; GUARD_BLOCK_CAPACITY],
    /// Next block in the owning thread's extension chain. Published
    /// once with release ordering when the block is linked; never
    /// mutated afterwards (`spec.md` §4.2 invariant (ii)).
    next: AtomicPtr<GuardBlock>,
}

impl super::pool::PoolBlock for GuardBlock {
    fn fresh() -> Self {
        Self {
            slots: core::array::from_fn(|_| GuardSlot::new()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl GuardBlock {

    pub(crate) fn slots(&self) -> &[GuardSlot; GUARD_BLOCK_CAPACITY] {
        &self.slots
    }

    pub(crate) fn next(&self) -> *mut GuardBlock {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: *mut GuardBlock) {
        self.next.store(next, Ordering::Relaxed);
    }
}

/// Thread-owned, non-atomic free-list of released slots spanning the
/// initial array and however many extension blocks are currently linked.
///
/// Not `Sync` on its own; it is always accessed through the owning
/// thread's [`super::hazard_storage::ThreadHazardStorage`], which is
/// itself only mutated by its owner.
pub(crate) struct FreeList {
    head: Cell<*mut GuardSlot>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: Cell::new(ptr::null_mut()),
        }
    }

    pub(crate) fn push(&self, slot: *mut GuardSlot) {
        // SAFETY: slot points at a live GuardSlot owned by this thread.
        unsafe { (*slot).set_free_next(self.head.get()) };
        self.head.set(slot);
    }

    pub(crate) fn pop(&self) -> Option<*mut GuardSlot> {
        let head = self.head.get();
        if head.is_null() {
            return None;
        }
        // SAFETY: head points at a live GuardSlot from a prior push.
        let next = unsafe { (*head).free_next() };
        self.head.set(next);
        Some(head)
    }

    /// Push every slot of `block` onto this free list, in index order.
    pub(crate) fn extend_with_block(&self, block: &GuardBlock) {
        for slot in block.slots().iter().rev() {
            self.push(slot as *const GuardSlot as *mut GuardSlot);
        }
    }

    pub(crate) fn clear(&self) {
        self.head.set(ptr::null_mut());
    }
}
