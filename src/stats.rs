//! Reclamation statistics.
//!
//! Counters mirror the ones the original DHP implementation tracks under
//! its `CDS_ENABLE_HPSTAT` switch; here they are unconditional since the
//! cost of a handful of relaxed increments is negligible next to a CAS
//! retry loop, and always-on counters are simpler to reason about than a
//! feature-gated pair of code paths.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Counters owned by the [`crate::smr::Smr`] singleton.
///
/// All fields use `Relaxed` ordering: they are diagnostic, not part of
/// any correctness argument (`SPEC_FULL.md` §3).
#[derive(Debug, Default)]
pub struct Counters {
    pub(crate) guard_allocated: AtomicUsize,
    pub(crate) guard_freed: AtomicUsize,
    pub(crate) retired_count: AtomicUsize,
    pub(crate) free_count: AtomicUsize,
    pub(crate) scan_count: AtomicUsize,
    pub(crate) help_scan_count: AtomicUsize,
    pub(crate) thread_rec_count: AtomicUsize,
    pub(crate) hp_block_count: AtomicUsize,
    pub(crate) retired_block_count: AtomicUsize,
    pub(crate) hp_extend_count: AtomicUsize,
    pub(crate) retired_extend_count: AtomicUsize,
}

impl Counters {
    pub(crate) const fn new() -> Self {
        Self {
            guard_allocated: AtomicUsize::new(0),
            guard_freed: AtomicUsize::new(0),
            retired_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            scan_count: AtomicUsize::new(0),
            help_scan_count: AtomicUsize::new(0),
            thread_rec_count: AtomicUsize::new(0),
            hp_block_count: AtomicUsize::new(0),
            retired_block_count: AtomicUsize::new(0),
            hp_extend_count: AtomicUsize::new(0),
            retired_extend_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            guard_allocated: self.guard_allocated.load(Ordering::Relaxed),
            guard_freed: self.guard_freed.load(Ordering::Relaxed),
            retired_count: self.retired_count.load(Ordering::Relaxed),
            free_count: self.free_count.load(Ordering::Relaxed),
            scan_count: self.scan_count.load(Ordering::Relaxed),
            help_scan_count: self.help_scan_count.load(Ordering::Relaxed),
            thread_rec_count: self.thread_rec_count.load(Ordering::Relaxed),
            hp_block_count: self.hp_block_count.load(Ordering::Relaxed),
            retired_block_count: self.retired_block_count.load(Ordering::Relaxed),
            hp_extend_count: self.hp_extend_count.load(Ordering::Relaxed),
            retired_extend_count: self.retired_extend_count.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of [`Counters`], returned by
/// `Smr::statistics()` and `Smr::postmortem_statistics()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Guard slots handed out across the process's lifetime.
    pub guard_allocated: usize,
    /// Guard slots returned to a free-list.
    pub guard_freed: usize,
    /// Pointers pushed to `retire`.
    pub retired_count: usize,
    /// Pointers whose deleter has run.
    pub free_count: usize,
    /// Calls to `scan`.
    pub scan_count: usize,
    /// Calls to `help_scan`.
    pub help_scan_count: usize,
    /// Thread records ever created.
    pub thread_rec_count: usize,
    /// Guard blocks ever allocated from the pool.
    pub hp_block_count: usize,
    /// Retired blocks ever allocated from the pool.
    pub retired_block_count: usize,
    /// Times a thread's hazard storage grew by one guard block.
    pub hp_extend_count: usize,
    /// Times a thread's retired array grew by one retired block.
    pub retired_extend_count: usize,
}

impl Stats {
    /// Retired pointers still outstanding (neither freed nor, as far as
    /// this snapshot can tell, migrated and freed elsewhere).
    pub fn outstanding(&self) -> usize {
        self.retired_count.saturating_sub(self.free_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let counters = Counters::new();
        Counters::bump(&counters.retired_count);
        Counters::bump(&counters.retired_count);
        Counters::bump(&counters.free_count);

        let snap = counters.snapshot();
        assert_eq!(snap.retired_count, 2);
        assert_eq!(snap.free_count, 1);
        assert_eq!(snap.outstanding(), 1);
    }
}
