//! Michael/Harris ordered singly-linked list, built on the DHP SMR
//! runtime (`SPEC_FULL.md` §4.9, `spec.md` §4.9).
//!
//! Deletion is logical-then-physical: a node is first marked via the
//! low bit of its `next` pointer, then unlinked with a CAS on the
//! predecessor's link. Any traversal that encounters a marked node
//! helps finish the physical unlink before continuing, the classic
//! Harris technique. Hazard pointers (two per traversal, handed off
//! hand-over-hand as the walk advances) keep both the current and
//! candidate-next node alive across the unmarked reads and CASes.

use core::cmp::Ordering as CmpOrdering;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::boxed::Box;

use crate::error::SmrError;
use crate::smr::{self, Guard, GuardedPtr};

const MARK: usize = 1;

#[inline]
fn is_marked<T>(p: *mut T) -> bool {
    (p as usize) & MARK != 0
}

#[inline]
fn unmark<T>(p: *mut T) -> *mut T {
    ((p as usize) & !MARK) as *mut T
}

#[inline]
fn marked<T>(p: *mut T) -> *mut T {
    ((p as usize) | MARK) as *mut T
}

struct Node<K, V> {
    key: K,
    value: V,
    next: AtomicPtr<Node<K, V>>,
}

/// A lock-free ordered set/map keyed by `K` (`spec.md` §4.9).
pub struct OrderedList<K, V> {
    head: AtomicPtr<Node<K, V>>,
}

impl<K, V> Default for OrderedList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

struct SearchResult<K, V> {
    prev: *const AtomicPtr<Node<K, V>>,
    curr: *mut Node<K, V>,
    found: bool,
}

impl<K: Ord, V> OrderedList<K, V> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Walk the list looking for `key`, physically unlinking any
    /// logically-deleted node encountered along the way
    /// (`spec.md` §4.9 "find").
    fn search(
        &self,
        key: &K,
        prev_guard: &mut Guard,
        curr_guard: &mut Guard,
    ) -> Result<SearchResult<K, V>, SmrError> {
        'restart: loop {
            let mut prev: *const AtomicPtr<Node<K, V>> = &self.head;
            // SAFETY: prev always points at a live AtomicPtr: the list's
            // head, or a still-protected node's `next`.
            let mut curr = curr_guard.protect_with(unsafe { &*prev }, |p| unmark(p));

            loop {
                if curr.is_null() {
                    return Ok(SearchResult {
                        prev,
                        curr,
                        found: false,
                    });
                }

                // SAFETY: curr is protected by curr_guard.
                let curr_ref = unsafe { &*curr };
                let raw_next = curr_ref.next.load(Ordering::Acquire);

                if is_marked(raw_next) {
                    let next = unmark(raw_next);
                    // SAFETY: prev is a live AtomicPtr link.
                    let prev_ref = unsafe { &*prev };
                    if prev_ref
                        .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Relaxed)
                        .is_err()
                    {
                        continue 'restart;
                    }
                    // SAFETY: curr was produced by Box::into_raw::<Node<K,V>>.
                    let _ = unsafe { smr::retire(curr) };
                    curr = curr_guard.protect_with(prev_ref, |p| unmark(p));
                    continue;
                }

                match curr_ref.key.cmp(key) {
                    CmpOrdering::Less => {
                        // curr becomes the new prev; hand its protection
                        // from curr_guard to prev_guard and free up
                        // curr_guard for the next candidate.
                        core::mem::swap(prev_guard, curr_guard);
                        prev = &curr_ref.next;
                        curr = curr_guard.protect_with(unsafe { &*prev }, |p| unmark(p));
                    }
                    CmpOrdering::Equal => {
                        return Ok(SearchResult {
                            prev,
                            curr,
                            found: true,
                        });
                    }
                    CmpOrdering::Greater => {
                        return Ok(SearchResult {
                            prev,
                            curr,
                            found: false,
                        });
                    }
                }
            }
        }
    }

    /// Borrow the value for `key` without removing it, protected for as
    /// long as the returned handle is alive (`spec.md` §4.9 "find").
    pub fn find(&self, key: &K) -> Result<Option<GuardedPtr<V>>, SmrError> {
        let mut prev_guard = Guard::new()?;
        let mut curr_guard = Guard::new()?;
        let result = self.search(key, &mut prev_guard, &mut curr_guard)?;
        if !result.found {
            return Ok(None);
        }
        // SAFETY: result.curr is protected by curr_guard.
        let value_ptr: *mut V = unsafe { &(*result.curr).value as *const V as *mut V };
        Ok(Some(GuardedPtr::new(
            core::mem::replace(&mut curr_guard, Guard::unlinked()),
            value_ptr,
        )))
    }

    pub fn contains(&self, key: &K) -> Result<bool, SmrError> {
        Ok(self.find(key)?.is_some())
    }

    /// Insert `key`/`value` if `key` is not already present
    /// (`spec.md` §4.9 "insert"). Returns `false` without modifying the
    /// list if the key was already present.
    pub fn insert(&self, key: K, value: V) -> Result<bool, SmrError> {
        let mut prev_guard = Guard::new()?;
        let mut curr_guard = Guard::new()?;
        let mut key = key;
        let mut value = value;

        loop {
            let result = self.search(&key, &mut prev_guard, &mut curr_guard)?;
            if result.found {
                return Ok(false);
            }

            let node = Box::into_raw(Box::new(Node {
                key,
                value,
                next: AtomicPtr::new(result.curr),
            }));

            // SAFETY: result.prev is a live AtomicPtr link.
            let prev_ref = unsafe { &*result.prev };
            if prev_ref
                .compare_exchange(result.curr, node, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(true);
            }

            // Lost the race; reclaim the node and retry with a fresh
            // search (another insert or a concurrent delete changed the
            // neighborhood).
            // SAFETY: node was never published.
            let boxed = unsafe { Box::from_raw(node) };
            let Node { key: k, value: v, .. } = *boxed;
            key = k;
            value = v;
        }
    }

    /// Logically delete `key`, then try to physically unlink it
    /// (`spec.md` §4.9 "erase"). A failed physical unlink is not an
    /// error — the next `search` to pass through will finish it.
    pub fn erase(&self, key: &K) -> Result<bool, SmrError> {
        let mut prev_guard = Guard::new()?;
        let mut curr_guard = Guard::new()?;

        loop {
            let result = self.search(key, &mut prev_guard, &mut curr_guard)?;
            if !result.found {
                return Ok(false);
            }

            // SAFETY: result.curr is protected by curr_guard.
            let curr_ref = unsafe { &*result.curr };
            let next = curr_ref.next.load(Ordering::Acquire);
            if is_marked(next) {
                continue;
            }
            if curr_ref
                .next
                .compare_exchange(next, marked(next), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // SAFETY: result.prev is a live AtomicPtr link.
            let prev_ref = unsafe { &*result.prev };
            if prev_ref
                .compare_exchange(result.curr, unmark(next), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: result.curr was produced by Box::into_raw::<Node<K,V>>.
                let _ = unsafe { smr::retire(result.curr) };
            }
            return Ok(true);
        }
    }

    /// Logically delete `key` and return its value, protected for as
    /// long as the returned handle is alive (`spec.md` §4.9 "extract").
    pub fn extract(&self, key: &K) -> Result<Option<GuardedPtr<V>>, SmrError> {
        let mut prev_guard = Guard::new()?;
        let mut curr_guard = Guard::new()?;

        loop {
            let result = self.search(key, &mut prev_guard, &mut curr_guard)?;
            if !result.found {
                return Ok(None);
            }

            // SAFETY: result.curr is protected by curr_guard.
            let curr_ref = unsafe { &*result.curr };
            let next = curr_ref.next.load(Ordering::Acquire);
            if is_marked(next) {
                continue;
            }
            if curr_ref
                .next
                .compare_exchange(next, marked(next), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // SAFETY: result.prev is a live AtomicPtr link.
            let prev_ref = unsafe { &*result.prev };
            if prev_ref
                .compare_exchange(result.curr, unmark(next), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: result.curr was produced by Box::into_raw::<Node<K,V>>.
                let _ = unsafe { smr::retire(result.curr) };
            }

            let value_ptr: *mut V = unsafe { &(*result.curr).value as *const V as *mut V };
            return Ok(Some(GuardedPtr::new(
                core::mem::replace(&mut curr_guard, Guard::unlinked()),
                value_ptr,
            )));
        }
    }

    /// Atomically replace the value for `key` with `value`, implemented
    /// as a single CAS that splices a replacement node in where the old
    /// one was (`spec.md` §4.9 "update"). Returns the previous value,
    /// protected for as long as the returned handle is alive, or `None`
    /// if `key` was not present (unlike `insert`, `update` never creates
    /// a new entry).
    pub fn update(&self, key: K, value: V) -> Result<Option<GuardedPtr<V>>, SmrError> {
        let mut prev_guard = Guard::new()?;
        let mut curr_guard = Guard::new()?;
        let mut key = key;
        let mut value = value;

        loop {
            let result = self.search(&key, &mut prev_guard, &mut curr_guard)?;
            if !result.found {
                return Ok(None);
            }

            // SAFETY: result.curr is protected by curr_guard.
            let curr_ref = unsafe { &*result.curr };
            let next = curr_ref.next.load(Ordering::Acquire);
            if is_marked(next) {
                continue;
            }

            let node = Box::into_raw(Box::new(Node {
                key,
                value,
                next: AtomicPtr::new(unmark(next)),
            }));

            if curr_ref
                .next
                .compare_exchange(next, marked(next), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // SAFETY: node was never published.
                let boxed = unsafe { Box::from_raw(node) };
                let Node { key: k, value: v, .. } = *boxed;
                key = k;
                value = v;
                continue;
            }

            // SAFETY: result.prev is a live AtomicPtr link.
            let prev_ref = unsafe { &*result.prev };
            if prev_ref
                .compare_exchange(result.curr, node, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // curr is now marked but we lost the splice; another
                // traversal will finish unlinking it. Reclaim our node
                // and retry from scratch.
                // SAFETY: node was never published.
                let boxed = unsafe { Box::from_raw(node) };
                let Node { key: k, value: v, .. } = *boxed;
                key = k;
                value = v;
                continue;
            }

            // SAFETY: result.curr was produced by Box::into_raw::<Node<K,V>>.
            let _ = unsafe { smr::retire(result.curr) };
            let old_value_ptr: *mut V = unsafe { &(*result.curr).value as *const V as *mut V };
            return Ok(Some(GuardedPtr::new(
                core::mem::replace(&mut curr_guard, Guard::unlinked()),
                old_value_ptr,
            )));
        }
    }
}

unsafe impl<K: Send, V: Send> Send for OrderedList<K, V> {}
unsafe impl<K: Send, V: Send> Sync for OrderedList<K, V> {}

impl<K, V> Drop for OrderedList<K, V> {
    fn drop(&mut self) {
        // By the time a list is dropped, the caller has exclusive
        // ownership, so remaining nodes can be freed directly.
        let mut cur = unmark(*self.head.get_mut());
        while !cur.is_null() {
            // SAFETY: cur was produced by Box::into_raw::<Node<K,V>>.
            let boxed = unsafe { Box::from_raw(cur) };
            cur = unmark(boxed.next.load(Ordering::Relaxed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn with_smr(f: impl FnOnce()) {
        let _guard = TEST_LOCK.lock().unwrap();
        smr::construct(8);
        smr::attach_thread().unwrap();
        f();
        smr::detach_thread().unwrap();
        smr::destruct(true);
    }

    #[test]
    fn insert_keeps_keys_ordered_and_rejects_duplicates() {
        with_smr(|| {
            let list: OrderedList<i32, &'static str> = OrderedList::new();
            assert!(list.insert(5, "five").unwrap());
            assert!(list.insert(1, "one").unwrap());
            assert!(list.insert(3, "three").unwrap());
            assert!(!list.insert(3, "three-again").unwrap());

            assert_eq!(*list.find(&1).unwrap().unwrap(), "one");
            assert_eq!(*list.find(&3).unwrap().unwrap(), "three");
            assert_eq!(*list.find(&5).unwrap().unwrap(), "five");
            assert!(list.find(&4).unwrap().is_none());
        });
    }

    #[test]
    fn erase_removes_entry_and_is_idempotent() {
        with_smr(|| {
            let list: OrderedList<i32, i32> = OrderedList::new();
            list.insert(1, 10).unwrap();
            list.insert(2, 20).unwrap();

            assert!(list.erase(&1).unwrap());
            assert!(!list.erase(&1).unwrap());
            assert!(list.find(&1).unwrap().is_none());
            assert_eq!(*list.find(&2).unwrap().unwrap(), 20);
        });
    }

    #[test]
    fn extract_returns_value_and_removes_it() {
        with_smr(|| {
            let list: OrderedList<i32, i32> = OrderedList::new();
            list.insert(7, 70).unwrap();

            let extracted = list.extract(&7).unwrap().unwrap();
            assert_eq!(*extracted, 70);
            drop(extracted);
            assert!(list.find(&7).unwrap().is_none());
        });
    }

    #[test]
    fn update_replaces_value_for_existing_key_only() {
        with_smr(|| {
            let list: OrderedList<i32, i32> = OrderedList::new();
            list.insert(1, 100).unwrap();

            let old = list.update(1, 200).unwrap().unwrap();
            assert_eq!(*old, 100);
            drop(old);
            assert_eq!(*list.find(&1).unwrap().unwrap(), 200);

            assert!(list.update(2, 999).unwrap().is_none());
            assert!(list.find(&2).unwrap().is_none());
        });
    }
}
