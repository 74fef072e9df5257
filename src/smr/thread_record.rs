//! Thread records and the global thread-record list (`SPEC_FULL.md` §4.4,
//! §4.10 "Thread record state machine").

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;

use super::hazard_storage::ThreadHazardStorage;
use super::retired::RetiredArray;

/// Per-thread SMR bookkeeping: a hazard storage, a retired array, and
/// the synchronization counter that establishes happens-before between
/// hazard publication and a reclaimer's scan (`spec.md` §3, §5).
///
/// The `active` flag implements the full state machine of `spec.md`
/// §4.10 with a single boolean: `false` is `Inactive`; a successful
/// `compare_exchange(false, true)` by the owner is `attach`
/// (`Inactive`/`Unallocated` → `Active`); by `detach_thread` storing
/// `false` is `Active` → `Inactive`; `help_scan`'s claim-then-release
/// pair is the transient `Inactive` → `InactiveClaimed` → `Inactive`
/// excursion — from the flag's point of view it is indistinguishable
/// from a normal attach/detach, which is exactly how the original
/// design describes it (`spec.md` §4.6).
pub(crate) struct ThreadRecord {
    pub(crate) hazards: ThreadHazardStorage,
    pub(crate) retired: RetiredArray,
    pub(crate) sync: CachePadded<AtomicUsize>,
    pub(crate) active: AtomicBool,
    pub(crate) next: AtomicPtr<ThreadRecord>,
}

impl ThreadRecord {
    pub(crate) fn new(initial_hp_count: usize) -> Self {
        Self {
            hazards: ThreadHazardStorage::new(initial_hp_count),
            retired: RetiredArray::new(),
            sync: CachePadded::new(AtomicUsize::new(0)),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Bump this thread's `sync` counter with an acquire-release RMW,
    /// the combination that makes a preceding relaxed store into a
    /// guard slot visible to a scanner that later walks the
    /// thread-record list with acquire ordering (`spec.md` §4.1, §5).
    #[inline]
    pub(crate) fn sync(&self) {
        self.sync.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Attempt to claim an inactive record, either to reuse it on
    /// attach or to splice its retired list during `help_scan`.
    #[inline]
    pub(crate) fn try_claim(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Release a record back to `Inactive`, with release ordering so
    /// that a subsequent claim observes all writes made while active.
    #[inline]
    pub(crate) fn release(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// The global, append-only, singly-linked list of thread records
/// (`spec.md` §3, §5 "Shared-resource policy").
pub(crate) struct ThreadRecordList {
    head: AtomicPtr<ThreadRecord>,
}

impl ThreadRecordList {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Link a freshly allocated record at the head with release
    /// ordering (`spec.md` §4.4 "attach_thread").
    pub(crate) fn push_front(&self, record: *mut ThreadRecord) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: record is freshly allocated and not yet shared.
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                head,
                record,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Head of the list, acquire-ordered so a walk sees every record
    /// linked-before this load (`spec.md` §4.5 step 1).
    pub(crate) fn head(&self) -> *mut ThreadRecord {
        self.head.load(Ordering::Acquire)
    }

    /// Try to find and claim an inactive record for reuse
    /// (`spec.md` §4.4 "attach_thread").
    pub(crate) fn find_reusable(&self) -> Option<*mut ThreadRecord> {
        let mut cur = self.head();
        while !cur.is_null() {
            // SAFETY: cur is a live ThreadRecord; records are never
            // unlinked or freed while the SMR is constructed.
            let rec = unsafe { &*cur };
            if !rec.is_active() && rec.try_claim() {
                return Some(cur);
            }
            cur = rec.next.load(Ordering::Acquire);
        }
        None
    }

    /// Detach the entire list and return its former head, leaving this
    /// list empty. Only valid when the caller has exclusive access, which
    /// is `destruct`'s documented precondition (`spec.md` §4.4).
    pub(crate) fn take_for_destruct(&self) -> *mut ThreadRecord {
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Iterate every record currently linked, regardless of state.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&ThreadRecord)) {
        let mut cur = self.head();
        while !cur.is_null() {
            // SAFETY: cur is a live ThreadRecord.
            let rec = unsafe { &*cur };
            f(rec);
            cur = rec.next.load(Ordering::Acquire);
        }
    }
}
