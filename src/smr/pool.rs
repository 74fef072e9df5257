//! Lock-free guard-block / retired-block pool (`SPEC_FULL.md` §4.11,
//! `spec.md` §6.4).
//!
//! Blocks only ever have a single owner at a time — either a thread that
//! checked one out, or the pool itself — so a plain Treiber stack (no
//! hazard pointers needed) is enough to make `get`/`put` thread-safe. This
//! reuses [`crate::stack::Stack`] rather than inventing a second
//! CAS-retry primitive.
//!
//! The free-list node wrapping a returned block is ordinary heap
//! bookkeeping, but the block memory handed to callers is always
//! allocated and freed through the installed `AllocatorHooks`, both on a
//! free-list miss and on a recycle, so `set_memory_allocator` genuinely
//! governs block allocation rather than being a disguised no-op.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::allocator::AllocatorHooks;
use crate::error::SmrError;
use crate::stack::{Stack, StackEntry};

/// A block type usable with [`Pool`]. Blocks are always constructed
/// fresh (never reused across incompatible layouts), mirroring the
/// original design's "caller must zero/initialize" contract (`spec.md`
/// §5).
pub(crate) trait PoolBlock {
    fn fresh() -> Self;
}

/// A many-producer-many-consumer free-list of `T` blocks.
pub(crate) struct Pool<T> {
    free: Stack<T>,
}

impl<T: PoolBlock> Pool<T> {
    pub(crate) const fn new() -> Self {
        Self { free: Stack::new() }
    }

    /// Check out a block, reusing a returned one if available, else
    /// allocating fresh (`spec.md` §6.4 "`get` ... may allocate on
    /// miss"). Either way the returned pointer's memory was obtained
    /// from `hooks.alloc` and must be passed to [`Self::put`], never
    /// freed any other way.
    pub(crate) fn get(&self, hooks: &AllocatorHooks) -> Result<*mut T, SmrError> {
        let value = if let Some(entry) = unsafe { self.free.pop() } {
            // SAFETY: entry was produced by `Box::into_raw` in `put`.
            unsafe { Box::from_raw(entry) }.into_data()
        } else {
            T::fresh()
        };

        let raw = hooks
            .alloc(size_of::<T>())
            .ok_or(SmrError::AllocationFailed)?
            .as_ptr() as *mut T;
        // SAFETY: raw was just allocated by `hooks` with `T`'s size and
        // holds no live value yet.
        unsafe { raw.write(value) };
        Ok(raw)
    }

    /// Return a block to the pool. `block` must have been produced by
    /// [`Self::get`] on this pool; its memory is freed through `hooks`
    /// and the value it held is kept in an ordinary heap-allocated
    /// free-list node for the next `get` to reuse.
    pub(crate) fn put(&self, block: *mut T, hooks: &AllocatorHooks) {
        // SAFETY: block was returned by `get`, allocated through `hooks`
        // with `T`'s layout, and is uniquely owned by the caller.
        let value = unsafe { block.read() };
        // SAFETY: block's backing memory was allocated by `hooks.alloc`
        // with `size_of::<T>()` bytes, and nothing else references it.
        unsafe { hooks.free(NonNull::new_unchecked(block as *mut u8), size_of::<T>()) };

        let entry = Box::into_raw(Box::new(StackEntry::new(value)));
        // SAFETY: entry is a freshly boxed, unlinked StackEntry.
        unsafe { self.free.push(entry) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);

    impl PoolBlock for Counter {
        fn fresh() -> Self {
            Counter(0)
        }
    }

    #[test]
    fn reuses_returned_blocks() {
        let pool: Pool<Counter> = Pool::new();
        let hooks = AllocatorHooks::new();

        let b = pool.get(&hooks).unwrap();
        unsafe { (*b).0 = 7 };
        pool.put(b, &hooks);

        let b2 = pool.get(&hooks).unwrap();
        assert_eq!(unsafe { (*b2).0 }, 7, "returned block should be handed back out");
        pool.put(b2, &hooks);
    }

    #[test]
    fn allocates_fresh_on_miss() {
        let pool: Pool<Counter> = Pool::new();
        let hooks = AllocatorHooks::new();
        let b = pool.get(&hooks).unwrap();
        assert_eq!(unsafe { (*b).0 }, 0);
        pool.put(b, &hooks);
    }

    #[test]
    fn get_and_put_route_through_installed_hooks() {
        use crate::allocator::{Allocator, GlobalAllocator};
        use core::sync::atomic::{AtomicUsize, Ordering};

        static ALLOC_CALLS: AtomicUsize = AtomicUsize::new(0);
        static FREE_CALLS: AtomicUsize = AtomicUsize::new(0);

        unsafe fn counting_alloc(size: usize) -> *mut u8 {
            ALLOC_CALLS.fetch_add(1, Ordering::SeqCst);
            GlobalAllocator
                .malloc(size)
                .map_or(core::ptr::null_mut(), |p| p.as_ptr())
        }
        unsafe fn counting_free(ptr: *mut u8, size: usize) {
            FREE_CALLS.fetch_add(1, Ordering::SeqCst);
            if let Some(p) = core::ptr::NonNull::new(ptr) {
                unsafe { GlobalAllocator.free(p, size, false) };
            }
        }

        let pool: Pool<Counter> = Pool::new();
        let hooks = AllocatorHooks::new();
        assert!(hooks.install(counting_alloc, counting_free));

        let b = pool.get(&hooks).unwrap();
        assert_eq!(ALLOC_CALLS.load(Ordering::SeqCst), 1, "a miss must allocate through hooks");
        pool.put(b, &hooks);
        assert_eq!(FREE_CALLS.load(Ordering::SeqCst), 1, "put must free through hooks");

        let b2 = pool.get(&hooks).unwrap();
        assert_eq!(ALLOC_CALLS.load(Ordering::SeqCst), 2, "a recycle must also allocate through hooks");
        pool.put(b2, &hooks);
    }
}
