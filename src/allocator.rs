//! Memory allocator abstraction and the process-wide allocator hooks.
//!
//! This module defines the [`Allocator`] trait used by the block pools
//! ([`crate::smr::pool`]) and the process-wide `(alloc_fn, free_fn)` pair
//! that [`set_memory_allocator`] installs before [`crate::smr::construct`]
//! (`SPEC_FULL.md` §4.11, §5 "Allocator policy").
//!
//! # Design
//!
//! - **Sized deletes**: `free` receives the size of the allocation.
//! - **In-place reallocation**: `realloc`'s `may_move` flag, when false,
//!   requires the allocator to resize in place or fail.
//!
//! # Example
//!
//! ```
//! use dhp_smr::allocator::{Allocator, GlobalAllocator};
//!
//! let alloc = GlobalAllocator;
//! let ptr = alloc.malloc(1024).expect("allocation failed");
//! unsafe { alloc.free(ptr, 1024, false); }
//! ```

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::alloc::{alloc, dealloc, realloc as std_realloc, Layout};

/// A memory allocator usable by DHP's internal block pools.
///
/// # Safety
///
/// Implementations must ensure that:
/// - `malloc` returns properly aligned memory for any type;
/// - `realloc` preserves data up to `min(old_size, new_size)`;
/// - `free` only deallocates memory previously allocated by this allocator;
/// - all operations are thread-safe.
pub trait Allocator {
    /// Allocate a new memory block of at least `size` bytes.
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resize an existing memory block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this allocator with `old_size`.
    fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>>;

    /// Deallocate a memory block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this allocator with `size`, and
    /// must not be used after this call.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, defer: bool);
}

/// A wrapper around the global (system) allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAllocator;

impl Allocator for GlobalAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return NonNull::new(core::mem::align_of::<usize>() as *mut u8);
        }
        let layout = Layout::from_size_align(size, core::mem::align_of::<usize>()).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr)
    }

    fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>> {
        if old_size == 0 {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            // SAFETY: ptr was allocated by us with old_size.
            unsafe { self.free(ptr, old_size, false) };
            return NonNull::new(core::mem::align_of::<usize>() as *mut u8);
        }

        let old_layout = Layout::from_size_align(old_size, core::mem::align_of::<usize>()).ok()?;

        if !may_move {
            if new_size <= old_size {
                return Some(ptr);
            }
            return None;
        }

        // SAFETY: ptr was allocated with old_layout, new_size is non-zero.
        let new_ptr = unsafe { std_realloc(ptr.as_ptr(), old_layout, new_size) };
        NonNull::new(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, _defer: bool) {
        if size == 0 {
            return;
        }
        let layout = match Layout::from_size_align(size, core::mem::align_of::<usize>()) {
            Ok(l) => l,
            Err(_) => return,
        };
        // SAFETY: caller guarantees ptr was allocated with size.
        dealloc(ptr.as_ptr(), layout);
    }
}

/// Raw allocation hook: `size -> *mut u8` (null on failure).
pub type AllocFn = unsafe fn(usize) -> *mut u8;
/// Raw deallocation hook: `(ptr, size)`.
pub type FreeFn = unsafe fn(*mut u8, usize);

unsafe fn default_alloc(size: usize) -> *mut u8 {
    GlobalAllocator
        .malloc(size)
        .map_or(core::ptr::null_mut(), NonNull::as_ptr)
}

unsafe fn default_free(ptr: *mut u8, size: usize) {
    if let Some(p) = NonNull::new(ptr) {
        // SAFETY: caller guarantees ptr/size match a prior default_alloc.
        GlobalAllocator.free(p, size, false);
    }
}

/// Process-wide allocator hooks, installable once before `construct`
/// (`SPEC_FULL.md` §5).
pub(crate) struct AllocatorHooks {
    alloc_fn: AtomicUsize,
    free_fn: AtomicUsize,
    frozen: AtomicBool,
}

impl AllocatorHooks {
    pub(crate) const fn new() -> Self {
        Self {
            alloc_fn: AtomicUsize::new(default_alloc as usize),
            free_fn: AtomicUsize::new(default_free as usize),
            frozen: AtomicBool::new(false),
        }
    }

    /// Install a custom `(alloc_fn, free_fn)` pair. No-op once frozen.
    ///
    /// Returns `false` if the hooks were already frozen by `construct`.
    pub(crate) fn install(&self, alloc_fn: AllocFn, free_fn: FreeFn) -> bool {
        if self.frozen.load(Ordering::Acquire) {
            return false;
        }
        self.alloc_fn.store(alloc_fn as usize, Ordering::Relaxed);
        self.free_fn.store(free_fn as usize, Ordering::Relaxed);
        true
    }

    /// Freeze the hooks; called once from `construct`.
    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub(crate) fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let f = self.alloc_fn.load(Ordering::Relaxed);
        // SAFETY: value was stored as a valid `AllocFn` by `install`/`new`.
        let f: AllocFn = unsafe { core::mem::transmute::<usize, AllocFn>(f) };
        // SAFETY: contract of `AllocFn`.
        NonNull::new(unsafe { f(size) })
    }

    pub(crate) fn free(&self, ptr: NonNull<u8>, size: usize) {
        let f = self.free_fn.load(Ordering::Relaxed);
        // SAFETY: value was stored as a valid `FreeFn` by `install`/`new`.
        let f: FreeFn = unsafe { core::mem::transmute::<usize, FreeFn>(f) };
        // SAFETY: contract of `FreeFn`.
        unsafe { f(ptr.as_ptr(), size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_allocator_is_zero_sized() {
        assert_eq!(core::mem::size_of::<GlobalAllocator>(), 0);
    }

    #[test]
    fn malloc_then_free() {
        let alloc = GlobalAllocator;
        let ptr = alloc.malloc(1024).expect("allocation failed");
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xAB, 1024);
            alloc.free(ptr, 1024, false);
        }
    }

    #[test]
    fn realloc_grow_preserves_data() {
        let alloc = GlobalAllocator;
        let ptr = alloc.malloc(16).expect("allocation failed");
        unsafe {
            for i in 0..16 {
                *ptr.as_ptr().add(i) = i as u8;
            }
        }
        let new_ptr = alloc.realloc(ptr, 16, 1024, true).expect("realloc failed");
        unsafe {
            for i in 0..16 {
                assert_eq!(*new_ptr.as_ptr().add(i), i as u8);
            }
            alloc.free(new_ptr, 1024, false);
        }
    }

    #[test]
    fn multiple_allocations_roundtrip() {
        let alloc = GlobalAllocator;
        let mut ptrs = Vec::new();
        for i in 1..=64 {
            ptrs.push((alloc.malloc(i * 8).expect("allocation failed"), i * 8));
        }
        for (ptr, size) in ptrs {
            unsafe { alloc.free(ptr, size, false) };
        }
    }

    #[test]
    fn hooks_default_to_global_allocator() {
        let hooks = AllocatorHooks::new();
        let ptr = hooks.alloc(64).expect("allocation failed");
        hooks.free(ptr, 64);
    }

    #[test]
    fn hooks_reject_install_after_freeze() {
        let hooks = AllocatorHooks::new();
        hooks.freeze();
        assert!(!hooks.install(default_alloc, default_free));
    }
}
