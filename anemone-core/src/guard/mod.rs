//! Guard trait for memory reclamation strategies.
//!
//! Lock-free containers unlink nodes that other threads may still be
//! traversing; the `Guard` trait is the seam through which those nodes are
//! retired safely.
//!
//! # Design
//!
//! Collections are generic over their reclamation strategy:
//!
//! ```text
//! OrderedList<T, G: Guard>
//!     │
//!     ├── OrderedList<T, EpochGuard>      (production, anemone-crossbeam)
//!     └── OrderedList<T, DeferredGuard>   (testing, defer-until-drop)
//! ```
//!
//! A node retired through `defer_destroy` must never be freed while a
//! thread that loaded a reference to it before the unlink became visible
//! may still hold that reference.

mod deferred_guard;

use std::ops::Deref;

pub use deferred_guard::{DeferredGuard, DeferredRef};

/// A memory reclamation guard that protects concurrent access to nodes.
///
/// # Safety Contract
///
/// Implementations must ensure:
/// 1. Nodes passed to `defer_destroy` are not freed until no reader that
///    predates the unlink can still reach them
/// 2. `GuardedRef` keeps the referenced data valid for its lifetime
///
/// The guard stored in a collection schedules deferred destruction.
/// Actual thread pinning (for epoch-based guards) happens per-operation
/// via `pin`, not when the stored guard is created.
pub trait Guard: Sized + Default + Send + Sync {
    /// A reference protected by a guard of this type.
    ///
    /// Must implement `Deref<Target = T>` for transparent access.
    type GuardedRef<'a, T: 'a>: Deref<Target = T>;

    /// An active guard that protects reads for its lifetime.
    ///
    /// For epoch-based guards this holds an actual pinned epoch guard.
    /// For deferred guards this can be `()` since protection comes from
    /// the collection's stored guard.
    type ReadGuard: Sized;

    /// Pin an active read guard for the duration of an operation.
    fn pin() -> Self::ReadGuard;

    /// Schedule a node for deferred destruction.
    ///
    /// # Safety
    ///
    /// - `node` must be a valid pointer previously allocated by the caller
    /// - `node` must be unlinked (not reachable by new traversals)
    /// - `dealloc` must be the correct deallocation function for `node`
    /// - the same pointer must not be retired twice
    unsafe fn defer_destroy<N>(&self, node: *mut N, dealloc: unsafe fn(*mut N));

    /// Create a guarded reference from a raw pointer.
    ///
    /// # Safety
    ///
    /// - `ptr` must point to valid data reachable under some active guard
    /// - the data must remain valid for lifetime `'a`
    unsafe fn make_ref<'a, T: 'a>(ptr: *const T) -> Self::GuardedRef<'a, T>;
}
