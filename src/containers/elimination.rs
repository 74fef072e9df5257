//! Elimination back-off array for the Treiber stack (`SPEC_FULL.md` §4.8,
//! `spec.md` §4.8 "Optional elimination back-off").
//!
//! A push offers its value in a slot; a pop that finds an offer claims
//! it directly. A matched pair never touches the stack's head pointer,
//! so no hazard pointer is needed for it — the value never entered the
//! stack (`spec.md` §4.8).

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::boxed::Box;

use crate::backoff::Backoff;

const SLOTS: usize = 8;
const SPIN_BOUND: u32 = 32;

thread_local! {
    static SLOT_PICK: Cell<usize> = const { Cell::new(0) };
}

fn pick_slot() -> usize {
    SLOT_PICK.with(|c| {
        let v = c.get();
        c.set(v.wrapping_add(1));
        v % SLOTS
    })
}

pub(crate) struct EliminationArray<T> {
    slots: [AtomicPtr<T>; SLOTS],
}

impl<T> EliminationArray<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Offer `value` to a concurrent [`Self::try_pop`]. Returns `Err`
    /// with the value back if no partner showed up within the spin
    /// bound, so the caller can fall back to the main CAS path.
    pub(crate) fn try_push(&self, value: T) -> Result<(), T> {
        let slot = &self.slots[pick_slot()];
        let boxed = Box::into_raw(Box::new(value));

        if slot
            .compare_exchange(ptr::null_mut(), boxed, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // SAFETY: boxed was never published to another thread.
            return Err(*unsafe { Box::from_raw(boxed) });
        }

        let mut backoff = Backoff::new();
        for _ in 0..SPIN_BOUND {
            if slot.load(Ordering::Acquire).is_null() {
                return Ok(());
            }
            backoff.spin();
        }

        match slot.compare_exchange(boxed, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed) {
            // We retracted our own unconsumed offer.
            Ok(_) => Err(*unsafe { Box::from_raw(boxed) }),
            // A pop claimed it between our timeout check and the retract.
            Err(_) => Ok(()),
        }
    }

    /// Look for a pending offer and claim it. Returns `None` if the
    /// chosen slot is empty; the caller falls back to the main CAS path.
    pub(crate) fn try_pop(&self) -> Option<T> {
        let slot = &self.slots[pick_slot()];
        let offered = slot.load(Ordering::Acquire);
        if offered.is_null() {
            return None;
        }
        if slot
            .compare_exchange(offered, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: offered was published by try_push and not yet
            // claimed by anyone else.
            Some(*unsafe { Box::from_raw(offered) })
        } else {
            None
        }
    }
}
