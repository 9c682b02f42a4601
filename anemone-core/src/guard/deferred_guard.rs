//! Deferred guard implementation for testing.
//!
//! `DeferredGuard` defers all node destruction until the guard itself is
//! dropped, which for a collection means until the collection is dropped.

#[cfg(debug_assertions)]
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Mutex;

use super::Guard;

/// A simple guard that defers all node destruction until it is dropped.
///
/// Useful for tests where destruction timing should be predictable. Not
/// suitable for long-running workloads: retired nodes accumulate until the
/// owning collection drops.
///
/// # Thread Safety
///
/// Retired nodes are collected from multiple threads behind a `Mutex`; the
/// mutex is only taken on the retirement path, never during traversal.
pub struct DeferredGuard {
    deferred: Mutex<Vec<DeferredNode>>,
    #[cfg(debug_assertions)]
    seen: Mutex<HashSet<usize>>,
}

struct DeferredNode {
    ptr: *mut (),
    dealloc: unsafe fn(*mut ()),
}

// Safety: DeferredNode only carries the raw pointer and its deallocation
// function; access is synchronized by the mutex above.
unsafe impl Send for DeferredNode {}

impl DeferredGuard {
    pub fn new() -> Self {
        DeferredGuard {
            deferred: Mutex::new(Vec::new()),
            #[cfg(debug_assertions)]
            seen: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for DeferredGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferredGuard {
    fn drop(&mut self) {
        let nodes = self.deferred.get_mut().unwrap();
        for node in nodes.drain(..) {
            unsafe {
                (node.dealloc)(node.ptr);
            }
        }
    }
}

/// A reference wrapper for DeferredGuard.
///
/// Since DeferredGuard defers all destruction until drop, references are
/// valid for as long as the guard exists.
pub struct DeferredRef<'a, T> {
    data: &'a T,
}

impl<'a, T> DeferredRef<'a, T> {
    pub fn new(data: &'a T) -> Self {
        DeferredRef { data }
    }
}

impl<T> Deref for DeferredRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl Guard for DeferredGuard {
    type GuardedRef<'a, T: 'a> = DeferredRef<'a, T>;

    /// ReadGuard is a no-op: the stored guard protects every node.
    type ReadGuard = ();

    fn pin() -> Self::ReadGuard {}

    unsafe fn defer_destroy<N>(&self, node: *mut N, dealloc: unsafe fn(*mut N)) {
        #[cfg(debug_assertions)]
        {
            let mut seen = self.seen.lock().unwrap();
            assert!(
                seen.insert(node as usize),
                "duplicate defer_destroy at {:#x}",
                node as usize
            );
        }

        let node = DeferredNode {
            ptr: node as *mut (),
            dealloc: unsafe {
                std::mem::transmute::<unsafe fn(*mut N), unsafe fn(*mut ())>(dealloc)
            },
        };
        self.deferred.lock().unwrap().push(node);
    }

    unsafe fn make_ref<'a, T: 'a>(ptr: *const T) -> Self::GuardedRef<'a, T> {
        // Safety: caller guarantees ptr stays valid for 'a
        DeferredRef::new(unsafe { &*ptr })
    }
}
