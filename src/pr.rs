//! Memory fences and the CPU pause hint used by every CAS retry loop.
//!
//! # Memory Ordering
//!
//! - [`fence_acquire`]: acquire fence
//! - [`fence_release`]: release fence
//! - [`fence_acqrel`]: acquire-release fence
//! - [`fence_memory`]: full (sequentially consistent) fence
//!
//! # Progress Guarantees
//!
//! - **Wait-free**: fence operations, [`stall`]
//! - **Lock-free**: everything built on top of these (CAS retry loops)

use core::sync::atomic::{compiler_fence, fence, Ordering};

/// Compiler barrier only, no hardware fence.
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Acquire fence.
#[inline(always)]
pub fn fence_acquire() {
    fence(Ordering::Acquire);
}

/// Release fence.
#[inline(always)]
pub fn fence_release() {
    fence(Ordering::Release);
}

/// Acquire-release fence.
#[inline(always)]
pub fn fence_acqrel() {
    fence(Ordering::AcqRel);
}

/// Full (sequentially consistent) memory fence.
#[inline(always)]
pub fn fence_memory() {
    fence(Ordering::SeqCst);
}

/// CPU pause hint for spin loops; reduces power draw and contention on
/// the memory subsystem while retrying a CAS.
#[inline(always)]
pub fn stall() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_and_stall_do_not_panic() {
        barrier();
        fence_acquire();
        fence_release();
        fence_acqrel();
        fence_memory();
        stall();
    }
}
