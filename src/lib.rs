//! # Dynamic Hazard Pointer safe memory reclamation
//!
//! A Dynamic Hazard Pointer (DHP) safe memory reclamation runtime, and
//! two lock-free containers built on it, ported in spirit from the
//! [Concurrency Kit](http://concurrencykit.org/) C library's approach
//! to lock-free primitives and from `cds::gc::DHP` in
//! [libcds](https://github.com/khizmax/libcds).
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`allocator`] - Memory allocator abstraction and process-wide allocator hooks
//! - [`error`] - Error kinds surfaced by the SMR runtime
//! - [`stats`] - Reclamation statistics
//!
//! ### Core Primitives
//! - [`pr`] - Memory fences and the CPU pause hint
//! - [`mod@backoff`] - Exponential backoff for contention management
//! - [`stack`] - Lock-free stack (the building block behind the guard/retired-block pools)
//!
//! ### SMR Runtime
//! - [`smr`] - The DHP singleton: `construct`/`destruct`, `attach_thread`/`detach_thread`,
//!   `retire`, `scan`, `help_scan`, and the [`smr::Guard`] / [`smr::GuardArray`] /
//!   [`smr::GuardedPtr`] hazard-pointer API
//!
//! ### Containers
//! - [`containers::treiber_stack`] - Treiber-style lock-free stack with elimination back-off
//! - [`containers::michael_list`] - Michael/Harris ordered singly-linked list

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Memory allocator abstraction and process-wide allocator hooks.
pub mod allocator;

/// Error kinds surfaced by the SMR runtime.
pub mod error;

/// Reclamation statistics.
pub mod stats;

// =============================================================================
// Tier 1: Core Primitives (Depends on Tier 0)
// =============================================================================

/// Memory fences and the CPU pause hint used by every CAS retry loop.
pub mod pr;

// =============================================================================
// Tier 2: Basic Building Blocks (Depends on Tiers 0-1)
// =============================================================================

/// Exponential backoff for contention management.
pub mod backoff;

/// Lock-free stack, the primitive behind the guard/retired-block pools.
pub mod stack;

// =============================================================================
// Tier 3: SMR Runtime (Depends on Tiers 0-2)
// =============================================================================

/// The Dynamic Hazard Pointer SMR runtime.
pub mod smr;

// =============================================================================
// Tier 4: Containers (Depends on Tiers 0-3)
// =============================================================================

/// Lock-free containers built on the DHP SMR runtime.
pub mod containers;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use allocator::{Allocator, GlobalAllocator};
pub use error::SmrError;
pub use smr::{Guard, GuardArray, GuardedPtr};
pub use stats::Stats;
