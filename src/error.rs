//! Error kinds surfaced by the SMR runtime.
//!
//! Containers never expose these on their own public surface (see the
//! module docs on [`crate::smr`]); they exist for the runtime's own entry
//! points and for tests that want to observe misuse directly.

/// An error returned by an SMR runtime operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SmrError {
    /// `construct` has not been called, or `destruct` already tore the
    /// singleton down.
    #[error("DHP SMR has not been constructed")]
    NotInitialized,

    /// `set_memory_allocator` was called after `construct` already froze
    /// the allocator pair.
    #[error("DHP SMR is already constructed")]
    AlreadyConstructed,

    /// The calling thread has no thread record; `attach_thread` was never
    /// called, or a prior `detach_thread` was not followed by a new
    /// `attach_thread`.
    #[error("current thread is not attached to DHP SMR")]
    NotAttached,

    /// The backing allocator (global or installed) returned null.
    #[error("allocation failed")]
    AllocationFailed,
}

impl SmrError {
    /// Panic with this error's message in debug builds; return it in
    /// release builds. Used at the handful of call sites the design
    /// classifies as programmer errors (`spec.md` §7).
    #[track_caller]
    pub(crate) fn programmer_error(self) -> Self {
        if cfg!(debug_assertions) {
            panic!("{self}");
        }
        self
    }
}
