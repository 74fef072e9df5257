//! Treiber-style lock-free stack with optional elimination back-off,
//! built on the DHP SMR runtime (`SPEC_FULL.md` §4.8, `spec.md` §4.8).
//!
//! `pop` hands back a [`GuardedPtr`] rather than an owned value: the
//! popped node is retired through [`crate::smr::retire`] as soon as it
//! is unlinked, but the guard bundled into the returned `GuardedPtr`
//! keeps it alive until the caller drops it, exactly like
//! [`super::michael_list`]'s `extract`/`update`. A concurrent `pop`
//! still mid-CAS on the same node holds its own hazard pointer on it
//! via [`crate::smr::Guard::protect`], so the SMR runtime won't reclaim
//! it out from under either reader.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::boxed::Box;

use super::elimination::EliminationArray;
use crate::backoff::Backoff;
use crate::error::SmrError;
use crate::smr::{self, Guard, GuardedPtr};

struct Node<T> {
    data: T,
    next: AtomicPtr<Node<T>>,
}

/// A lock-free LIFO stack (`spec.md` §4.8).
pub struct Stack<T> {
    head: AtomicPtr<Node<T>>,
    elimination: EliminationArray<T>,
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            elimination: EliminationArray::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Push `value`. Requires the calling thread to be attached to the
    /// DHP SMR (`spec.md` §5 "every operation requires an attached
    /// thread").
    pub fn push(&self, value: T) -> Result<(), SmrError> {
        let mut value = value;
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let node = Box::into_raw(Box::new(Node {
                data: value,
                next: AtomicPtr::new(head),
            }));

            if self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }

            // CAS lost the race; reclaim the node we just allocated and
            // recover the value to retry (or try eliminating with a
            // concurrent pop instead of hammering the head again).
            // SAFETY: node was never published.
            let boxed = unsafe { Box::from_raw(node) };
            let Node { data, .. } = *boxed;
            value = data;

            if backoff.is_maxed() {
                match self.elimination.try_push(value) {
                    Ok(()) => return Ok(()),
                    Err(v) => value = v,
                }
            }
            backoff.spin();
        }
    }

    /// Pop the top value, or `Ok(None)` if the stack is empty. Requires
    /// the calling thread to be attached.
    ///
    /// The returned [`GuardedPtr`] keeps the popped node alive; the node
    /// is only actually reclaimed once the `GuardedPtr` (and thus its
    /// guard) is dropped and a later `scan` finds no one still protects
    /// it.
    pub fn pop(&self) -> Result<Option<GuardedPtr<T>>, SmrError> {
        if let Some(v) = self.elimination.try_pop() {
            // This value never entered the stack: the elimination
            // handoff bypassed `self.head` entirely, so it was never
            // behind a hazard pointer. Wrap it in a node of its own so
            // it can be retired and returned the same way as a value
            // popped off the stack proper.
            let node = Box::into_raw(Box::new(Node {
                data: v,
                next: AtomicPtr::new(ptr::null_mut()),
            }));
            let mut guard = Guard::new()?;
            guard.assign(node);
            // SAFETY: node was produced by Box::into_raw::<Node<T>> above
            // and is reachable from nowhere else.
            if let Err(e) = unsafe { smr::retire(node) } {
                return Err(e);
            }
            // SAFETY: guard protects `node` for as long as the returned
            // GuardedPtr is alive.
            let data_ptr: *mut T = unsafe { &mut (*node).data as *mut T };
            return Ok(Some(GuardedPtr::new(guard, data_ptr)));
        }

        let mut guard = Guard::new()?;
        let mut backoff = Backoff::new();
        loop {
            let head = guard.protect(&self.head);
            if head.is_null() {
                return Ok(None);
            }

            // SAFETY: head is protected by `guard`; it cannot be freed
            // out from under us until the guard is cleared or dropped.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: head was produced by Box::into_raw::<Node<T>>.
                let data_ptr: *mut T = unsafe { &mut (*head).data as *mut T };
                // SAFETY: we won the CAS; no one else can unlink `head`
                // through the stack again. `guard` still protects it, so
                // retiring it now only marks it for reclamation once
                // every hazard on it (including this one) is gone.
                if let Err(e) = unsafe { smr::retire(head) } {
                    return Err(e);
                }
                return Ok(Some(GuardedPtr::new(guard, data_ptr)));
            }

            if let Some(v) = self.elimination.try_pop() {
                let node = Box::into_raw(Box::new(Node {
                    data: v,
                    next: AtomicPtr::new(ptr::null_mut()),
                }));
                guard.assign(node);
                // SAFETY: node was produced by Box::into_raw::<Node<T>>
                // above and is reachable from nowhere else.
                if let Err(e) = unsafe { smr::retire(node) } {
                    return Err(e);
                }
                let data_ptr: *mut T = unsafe { &mut (*node).data as *mut T };
                return Ok(Some(GuardedPtr::new(guard, data_ptr)));
            }
            backoff.spin();
        }
    }
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // By the time a Stack is dropped, the caller has exclusive
        // ownership, so remaining nodes can be freed directly rather
        // than routed through `retire`.
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: cur was produced by Box::into_raw::<Node<T>>.
            let boxed = unsafe { Box::from_raw(cur) };
            cur = boxed.next.load(Ordering::Relaxed);
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
    fn push_pop_is_lifo() {
        with_smr(|| {
            let stack: Stack<i32> = Stack::new();
            stack.push(1).unwrap();
            stack.push(2).unwrap();
            stack.push(3).unwrap();

            assert_eq!(*stack.pop().unwrap().unwrap(), 3);
            assert_eq!(*stack.pop().unwrap().unwrap(), 2);
            assert_eq!(*stack.pop().unwrap().unwrap(), 1);
            assert!(stack.pop().unwrap().is_none());
        });
    }

    #[test]
    fn pop_on_empty_stack_is_none() {
        with_smr(|| {
            let stack: Stack<i32> = Stack::new();
            assert!(stack.pop().unwrap().is_none());
        });
    }

    #[test]
    fn is_empty_tracks_contents() {
        with_smr(|| {
            let stack: Stack<i32> = Stack::new();
            assert!(stack.is_empty());
            stack.push(10).unwrap();
            assert!(!stack.is_empty());
            stack.pop().unwrap();
            assert!(stack.is_empty());
        });
    }

    #[test]
    fn popped_guarded_ptr_defers_retirement_past_pop_return() {
        with_smr(|| {
            let stack: Stack<i32> = Stack::new();
            stack.push(42).unwrap();

            let popped = stack.pop().unwrap().unwrap();
            // The node backing `popped` was retired inside `pop`, but the
            // guard bundled into it keeps it alive here, past `pop`'s
            // return, until `popped` itself is dropped.
            assert_eq!(*popped, 42);
            smr::scan().unwrap();
            assert_eq!(*popped, 42, "scan must not reclaim a still-guarded node");
        });
    }
}
