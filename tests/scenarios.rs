//! End-to-end scenarios exercising the public SMR and container surface
//! together, adapted from the concrete scenarios in `spec.md` §8.
//!
//! All SMR state is process-global, so every test serializes on
//! `TEST_LOCK` and drives its own `construct`/`destruct` pair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use dhp_smr::containers::michael_list::OrderedList;
use dhp_smr::containers::treiber_stack::Stack;
use dhp_smr::smr;

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn with_smr<F: FnOnce()>(initial_hp_count: usize, f: F) {
    let _guard = TEST_LOCK.lock().unwrap();
    smr::construct(initial_hp_count);
    f();
    smr::destruct(true);
}

/// A value whose drop is observable, used to tell when the SMR runtime
/// has actually reclaimed a node rather than merely unlinked it.
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scenario 1: single-thread stack round-trip (`spec.md` §8.1).
#[test]
fn single_thread_stack_round_trip() {
    with_smr(16, || {
        smr::attach_thread().unwrap();
        let stack: Stack<i32> = Stack::new();

        stack.push(1).unwrap();
        stack.push(2).unwrap();

        let a = stack.pop().unwrap().unwrap();
        let b = stack.pop().unwrap().unwrap();
        assert_eq!(*a, 2);
        assert_eq!(*b, 1);
        drop(a);
        drop(b);
        assert!(stack.is_empty());
        assert!(stack.pop().unwrap().is_none());

        smr::force_dispose().unwrap();
        let stats = smr::statistics();
        assert_eq!(stats.retired_count, 2);
        assert_eq!(stats.free_count, 2);

        smr::detach_thread().unwrap();
    });
}

/// Scenario 2 (`spec.md` §8.2), adapted to the Michael list: a reader
/// holds a `GuardedPtr` across a concurrent `extract` of the same key.
/// The node must not be dropped while the guard is held, and must be
/// dropped soon after it is released and a scan runs.
#[test]
fn hazard_observed_across_extract() {
    with_smr(16, || {
        smr::attach_thread().unwrap();
        let list: Arc<OrderedList<i32, DropCounter>> = Arc::new(OrderedList::new());
        let drops = Arc::new(AtomicUsize::new(0));
        list.insert(1, DropCounter(drops.clone())).unwrap();

        let held = list.find(&1).unwrap().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let list2 = list.clone();
        let drops2 = drops.clone();
        let worker = thread::spawn(move || {
            smr::attach_thread().unwrap();
            // Logically delete the held key and hammer the reclaimer
            // with unrelated traffic so a scan is very likely to run
            // while the reader's guard is still held.
            list2.extract(&1).unwrap();
            for k in 100..200 {
                list2.insert(k, DropCounter(drops2.clone())).unwrap();
                list2.erase(&k).unwrap();
                smr::scan().unwrap();
            }
            smr::detach_thread().unwrap();
        });
        worker.join().unwrap();

        // The held guard must have kept the node (and its value) alive
        // through all of that concurrent reclamation traffic.
        assert_eq!(drops.load(Ordering::SeqCst), 0, "node must survive while guarded");
        drop(held);

        // Releasing the guard and scanning should now be able to
        // reclaim it.
        smr::scan().unwrap();
        smr::force_dispose().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        smr::detach_thread().unwrap();
    });
}

/// Scenario 3: Michael list sorted insertion under concurrent writers
/// and a concurrent reader (`spec.md` §8.3).
#[test]
fn michael_list_sorted_insertion_under_concurrency() {
    with_smr(16, || {
        let list: Arc<OrderedList<i32, i32>> = Arc::new(OrderedList::new());
        const WRITERS: i32 = 5;
        const PER_WRITER: i32 = 100;

        let reader_list = list.clone();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader_stop = stop.clone();
        let reader = thread::spawn(move || {
            smr::attach_thread().unwrap();
            while !reader_stop.load(Ordering::Relaxed) {
                for k in 0..(WRITERS * PER_WRITER) {
                    let _ = reader_list.contains(&k);
                }
            }
            smr::detach_thread().unwrap();
        });

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let list = list.clone();
                thread::spawn(move || {
                    smr::attach_thread().unwrap();
                    for i in 0..PER_WRITER {
                        let key = w * PER_WRITER + i;
                        list.insert(key, key).unwrap();
                    }
                    smr::detach_thread().unwrap();
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();

        smr::attach_thread().unwrap();
        let mut extracted = Vec::new();
        for k in 0..(WRITERS * PER_WRITER) {
            if let Some(v) = list.extract(&k).unwrap() {
                extracted.push(*v);
            }
        }
        smr::detach_thread().unwrap();

        assert_eq!(extracted.len(), (WRITERS * PER_WRITER) as usize);
        let mut sorted = extracted.clone();
        sorted.sort_unstable();
        assert_eq!(extracted, sorted, "extraction order must already be sorted");
    });
}

/// Scenario 4: detach-stranded retirement is reclaimed by `help_scan`
/// (`spec.md` §8.4).
///
/// `detach_thread` already scans its own retired array before going
/// inactive, so an unhazarded retirement never survives a detach; what
/// actually gets stranded is a retirement another thread is still
/// hazarding at the moment of detach. This test engineers exactly that:
/// a third thread holds a hazard pointer on one retired node while the
/// owning thread detaches, then releases it, then a second thread's
/// `help_scan` + `scan` must be the one to finally free it.
#[test]
fn detach_stranded_retirement_reclaimed_by_help_scan() {
    use core::sync::atomic::AtomicPtr;
    use std::sync::mpsc::channel;

    with_smr(16, || {
        let drops = Arc::new(AtomicUsize::new(0));

        let held = Box::into_raw(Box::new(DropCounter(drops.clone())));
        let held_slot: Arc<AtomicPtr<DropCounter>> = Arc::new(AtomicPtr::new(held));

        let (ready_tx, ready_rx) = channel::<()>();
        let (release_tx, release_rx) = channel::<()>();
        let (done_tx, done_rx) = channel::<()>();

        let slot_for_holder = held_slot.clone();
        let holder = thread::spawn(move || {
            smr::attach_thread().unwrap();
            let mut guard = dhp_smr::Guard::new().unwrap();
            guard.protect(&slot_for_holder);
            ready_tx.send(()).unwrap();

            release_rx.recv().unwrap();
            drop(guard);
            smr::detach_thread().unwrap();
            done_tx.send(()).unwrap();
        });

        smr::attach_thread().unwrap();
        ready_rx.recv().unwrap();

        // SAFETY: held was produced by Box::into_raw and nothing else
        // owns it; the holder thread's guard above keeps it alive.
        unsafe { smr::retire(held).unwrap() };
        for _ in 0..9 {
            let boxed = Box::new(DropCounter(drops.clone()));
            // SAFETY: boxed was produced by Box::new and is uniquely owned.
            unsafe { smr::retire(Box::into_raw(boxed)).unwrap() };
        }

        // This thread's own detach below runs scan_record on itself,
        // which will free the 9 unhazarded items immediately but must
        // keep `held` alive because the holder thread's guard is still
        // published.
        smr::detach_thread().unwrap();
        assert_eq!(
            drops.load(Ordering::SeqCst),
            9,
            "the unhazarded items are reclaimed by detach's own scan"
        );

        release_tx.send(()).unwrap();
        done_rx.recv().unwrap();
        holder.join().unwrap();

        // At this point `held` sits in a now-inactive, unclaimed thread
        // record's retired array. A live thread must help_scan it over
        // and then scan to actually free it.
        smr::attach_thread().unwrap();
        smr::help_scan().unwrap();
        smr::scan().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 10, "help_scan must rescue the stranded node");
        smr::detach_thread().unwrap();
    });
}

/// Scenario 6: ABA defense on the Michael list under forced address
/// reuse (`spec.md` §8.6). A reader holds a `GuardedPtr` into a node
/// that is then erased and retired; while that guard lives, the node's
/// memory cannot be handed back to the allocator, so a fresh insert for
/// the same key is guaranteed to land at a different address rather
/// than silently reusing the stale one underneath the reader.
#[test]
fn aba_defense_on_michael_list_under_forced_address_reuse() {
    with_smr(16, || {
        smr::attach_thread().unwrap();
        let list: OrderedList<i32, &'static str> = OrderedList::new();
        list.insert(1, "first").unwrap();

        let held = list.find(&1).unwrap().unwrap();
        let stale_addr = held.get().unwrap() as *const &str as usize;

        assert!(list.erase(&1).unwrap(), "key must still be present before erase");
        smr::scan().unwrap();

        assert!(
            list.insert(1, "second").unwrap(),
            "erase must have fully unlinked the old key before reinsertion"
        );
        let fresh = list.find(&1).unwrap().unwrap();
        let fresh_addr = fresh.get().unwrap() as *const &str as usize;

        assert_ne!(
            stale_addr, fresh_addr,
            "a still-guarded node's address must never be handed to a new insert"
        );
        assert_eq!(*held, "first", "the original node's data must survive untouched");
        assert_eq!(*fresh, "second");

        drop(held);
        drop(fresh);
        smr::scan().unwrap();
        smr::force_dispose().unwrap();
        assert_eq!(*list.find(&1).unwrap().unwrap(), "second");

        smr::detach_thread().unwrap();
    });
}

/// Scenario 5: guard extension boundary (`spec.md` §8.5), exercised
/// through the public `GuardArray` surface rather than the internal
/// hazard-storage type directly.
#[test]
fn guard_array_extension_boundary() {
    with_smr(2, || {
        smr::attach_thread().unwrap();

        let before = smr::statistics().hp_extend_count;
        let _array: dhp_smr::GuardArray<3> = dhp_smr::GuardArray::new().unwrap();
        let after_first = smr::statistics().hp_extend_count;
        assert_eq!(after_first - before, 1, "3 guards on a 2-slot thread must extend exactly once");
        drop(_array);

        let second: dhp_smr::GuardArray<3> = dhp_smr::GuardArray::new().unwrap();
        let after_second = smr::statistics().hp_extend_count;
        assert_eq!(after_second, after_first, "the earlier extension block must be reused");
        drop(second);

        smr::detach_thread().unwrap();
    });
}
