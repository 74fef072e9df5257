//! The public hazard-pointer guard API (`SPEC_FULL.md` §4.7, §6.2).

use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::guard_slot::GuardSlot;
use super::thread_record::ThreadRecord;
use super::{allocator_hooks, guard_pool, stats, tls};
use crate::backoff::Backoff;
use crate::error::SmrError;

/// A single hazard-pointer guard (`spec.md` §4.7).
///
/// Movable, not copyable: moving a `Guard` transfers slot ownership the
/// same way any other Rust value does, so unlike the original design no
/// separate "moved-from" state needs modelling here — the old binding
/// simply no longer exists once moved.
pub struct Guard {
    slot: *mut GuardSlot,
    record: *mut ThreadRecord,
}

impl Guard {
    /// Allocate a linked guard for the current thread
    /// (`spec.md` §4.7 "Guard::Guard()").
    pub fn new() -> Result<Self, SmrError> {
        let record_ptr = tls()?;
        // SAFETY: record_ptr came from tls(), which only returns live records.
        let record = unsafe { &*record_ptr };
        let slot = record.hazards.alloc(guard_pool(), allocator_hooks(), stats())?;
        Ok(Self {
            slot,
            record: record_ptr,
        })
    }

    /// A guard holding no slot (`spec.md` §4.7 "unlinked").
    pub const fn unlinked() -> Self {
        Self {
            slot: ptr::null_mut(),
            record: ptr::null_mut(),
        }
    }

    /// Whether this guard currently owns a slot.
    pub fn is_linked(&self) -> bool {
        !self.slot.is_null()
    }

    /// Allocate a slot for this guard if it does not already have one
    /// (`spec.md` §4.7 "link").
    pub fn link(&mut self) -> Result<(), SmrError> {
        if self.is_linked() {
            return Ok(());
        }
        let record_ptr = tls()?;
        // SAFETY: record_ptr came from tls().
        let record = unsafe { &*record_ptr };
        self.slot = record.hazards.alloc(guard_pool(), allocator_hooks(), stats())?;
        self.record = record_ptr;
        Ok(())
    }

    /// Return the slot to the owning thread's free-list, leaving this
    /// guard unlinked (`spec.md` §4.7 "unlink").
    pub fn unlink(&mut self) {
        if self.slot.is_null() {
            return;
        }
        // SAFETY: record is the thread record this slot was allocated from.
        let record = unsafe { &*self.record };
        record.hazards.free(self.slot, stats());
        self.slot = ptr::null_mut();
        self.record = ptr::null_mut();
    }

    /// Release this guard's slot. Identical to [`Self::unlink`]; kept as
    /// a distinct name because the original design exposes both a
    /// base-class `unlink` and a derived-class `release`
    /// (`spec.md` §6.2 "release").
    pub fn release(&mut self) {
        self.unlink();
    }

    /// Protect whatever `src` currently holds, retrying if it changes
    /// before protection is published (`spec.md` §4.7 "protect").
    pub fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        self.protect_with(src, |p| p)
    }

    /// Protect a pointer derived from `src` via `project` — e.g. the next
    /// node reached through a just-loaded node — so the hazard covers a
    /// value other than the one directly loaded (`spec.md` §4.7 "protect"
    /// second overload).
    pub fn protect_with<T, U>(
        &mut self,
        src: &AtomicPtr<T>,
        project: impl Fn(*mut T) -> *mut U,
    ) -> *mut U {
        debug_assert!(self.is_linked(), "protect called on an unlinked guard");
        let mut backoff = Backoff::new();
        loop {
            let observed = src.load(Ordering::Acquire);
            let candidate = project(observed);
            self.assign(candidate);
            let reread = src.load(Ordering::Acquire);
            if reread == observed {
                return candidate;
            }
            backoff.spin();
        }
    }

    /// Publish `p` into this guard's slot unconditionally
    /// (`spec.md` §4.7 "assign").
    pub fn assign<T>(&mut self, p: *mut T) {
        debug_assert!(self.is_linked(), "assign called on an unlinked guard");
        // SAFETY: slot points at a live GuardSlot owned by `record`.
        unsafe { (*self.slot).set_relaxed(p as *mut ()) };
        // SAFETY: record is the thread record this slot belongs to; the
        // sync RMW is what publishes the relaxed store above to scanners.
        unsafe { (*self.record).sync() };
    }

    /// Clear the protected value without releasing the slot
    /// (`spec.md` §4.7 "clear").
    pub fn clear(&mut self) {
        if !self.slot.is_null() {
            // SAFETY: slot points at a live GuardSlot.
            unsafe { (*self.slot).clear() };
        }
    }

    /// Read the currently guarded value (`spec.md` §4.7 "get").
    pub fn get<T>(&self) -> *mut T {
        if self.slot.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: slot points at a live GuardSlot.
        unsafe { (*self.slot).read_relaxed() as *mut T }
    }

    /// Read the currently guarded value untyped
    /// (`spec.md` §4.7 "get_native").
    pub fn get_native(&self) -> *mut () {
        if self.slot.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: slot points at a live GuardSlot.
        unsafe { (*self.slot).read_relaxed() }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.unlink();
    }
}

/// A fixed-size array of `K` guards allocated together
/// (`spec.md` §4.7 "GuardArray").
pub struct GuardArray<const K: usize> {
    slots: [*mut GuardSlot; K],
    record: *mut ThreadRecord,
}

impl<const K: usize> GuardArray<K> {
    /// Allocate `K` linked slots for the current thread.
    pub fn new() -> Result<Self, SmrError> {
        let record_ptr = tls()?;
        // SAFETY: record_ptr came from tls().
        let record = unsafe { &*record_ptr };
        let allocated = record
            .hazards
            .alloc_array(K, guard_pool(), allocator_hooks(), stats())?;
        let mut slots = [ptr::null_mut(); K];
        for (dst, src) in slots.iter_mut().zip(allocated) {
            *dst = src;
        }
        Ok(Self {
            slots,
            record: record_ptr,
        })
    }

    /// Protect whatever `src` currently holds into slot `i`.
    pub fn protect<T>(&mut self, i: usize, src: &AtomicPtr<T>) -> *mut T {
        self.protect_with(i, src, |p| p)
    }

    /// Like [`Guard::protect_with`], for slot `i`.
    pub fn protect_with<T, U>(
        &mut self,
        i: usize,
        src: &AtomicPtr<T>,
        project: impl Fn(*mut T) -> *mut U,
    ) -> *mut U {
        let mut backoff = Backoff::new();
        loop {
            let observed = src.load(Ordering::Acquire);
            let candidate = project(observed);
            self.assign(i, candidate);
            let reread = src.load(Ordering::Acquire);
            if reread == observed {
                return candidate;
            }
            backoff.spin();
        }
    }

    /// Publish `p` into slot `i` unconditionally.
    pub fn assign<T>(&mut self, i: usize, p: *mut T) {
        // SAFETY: slots[i] points at a live GuardSlot owned by `record`.
        unsafe { (*self.slots[i]).set_relaxed(p as *mut ()) };
        // SAFETY: record is the thread record these slots belong to.
        unsafe { (*self.record).sync() };
    }

    /// Clear slot `i` without releasing it.
    pub fn clear(&mut self, i: usize) {
        // SAFETY: slots[i] points at a live GuardSlot.
        unsafe { (*self.slots[i]).clear() };
    }

    /// Read slot `i`'s currently guarded value.
    pub fn get<T>(&self, i: usize) -> *mut T {
        // SAFETY: slots[i] points at a live GuardSlot.
        unsafe { (*self.slots[i]).read_relaxed() as *mut T }
    }
}

impl<const K: usize> Drop for GuardArray<K> {
    fn drop(&mut self) {
        // SAFETY: record is the thread record these slots were allocated from.
        let record = unsafe { &*self.record };
        record.hazards.free_array(&self.slots, stats());
    }
}

/// A guard bundled with the pointer it protects, exposing `Deref` so
/// callers can use it like a smart pointer (`spec.md` §4.7 "guarded_ptr").
pub struct GuardedPtr<T> {
    guard: Guard,
    ptr: *mut T,
    _marker: PhantomData<T>,
}

impl<T> GuardedPtr<T> {
    pub(crate) fn new(guard: Guard, ptr: *mut T) -> Self {
        Self {
            guard,
            ptr,
            _marker: PhantomData,
        }
    }

    /// Whether the protected pointer is null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Borrow the protected value, or `None` if the pointer is null.
    pub fn get(&self) -> Option<&T> {
        if self.ptr.is_null() {
            None
        } else {
            // SAFETY: `self.guard` protects `self.ptr` for as long as
            // this GuardedPtr is alive.
            Some(unsafe { &*self.ptr })
        }
    }

    /// Discard the protected pointer and recover the underlying guard
    /// for reuse.
    pub fn into_guard(self) -> Guard {
        let mut guard = self.guard;
        guard.clear();
        guard
    }
}

impl<T> Deref for GuardedPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: see `get`.
        unsafe { &*self.ptr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicPtr;
    use std::sync::Mutex;

    // The SMR singleton is process-global; serialize tests that
    // construct/attach/detach it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn guard_round_trip() {
        let _guard = TEST_LOCK.lock().unwrap();
        crate::smr::construct(4);
        crate::smr::attach_thread().unwrap();

        let mut value = 7i32;
        let src: AtomicPtr<i32> = AtomicPtr::new(&mut value as *mut i32);

        let mut g = Guard::new().unwrap();
        assert!(g.is_linked());
        let protected = g.protect(&src);
        assert_eq!(unsafe { *protected }, 7);
        assert_eq!(g.get::<i32>(), protected);

        g.clear();
        assert!(g.get::<i32>().is_null());
        g.release();
        assert!(!g.is_linked());

        crate::smr::detach_thread().unwrap();
        crate::smr::destruct(true);
    }

    #[test]
    fn guard_array_allocates_k_independent_slots() {
        let _guard = TEST_LOCK.lock().unwrap();
        crate::smr::construct(4);
        crate::smr::attach_thread().unwrap();

        let mut a = 1i32;
        let mut b = 2i32;
        let src_a: AtomicPtr<i32> = AtomicPtr::new(&mut a as *mut i32);
        let src_b: AtomicPtr<i32> = AtomicPtr::new(&mut b as *mut i32);

        let mut arr: GuardArray<2> = GuardArray::new().unwrap();
        let pa = arr.protect(0, &src_a);
        let pb = arr.protect(1, &src_b);
        assert_eq!(unsafe { *pa }, 1);
        assert_eq!(unsafe { *pb }, 2);
        assert_ne!(arr.get::<i32>(0), arr.get::<i32>(1));

        drop(arr);
        crate::smr::detach_thread().unwrap();
        crate::smr::destruct(true);
    }
}
