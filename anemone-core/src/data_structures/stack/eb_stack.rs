use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::data_structures::elimination::{
    EliminationArray, EliminationBackend, DEFAULT_ELIMINATION_SIZE,
};
use crate::data_structures::internal::backoff::Backoff;
use crate::guard::Guard;

pub struct StackNode<T> {
    data: T,
    next: *mut StackNode<T>,
}

impl<T> StackNode<T> {
    fn alloc(data: T) -> *mut Self {
        Box::into_raw(Box::new(StackNode {
            data,
            next: ptr::null_mut(),
        }))
    }

    /// Take the value out of a node that was never published.
    ///
    /// # Safety
    /// The caller must exclusively own `node`.
    unsafe fn into_data(node: *mut Self) -> T {
        let boxed = unsafe { Box::from_raw(node) };
        boxed.data
    }

    unsafe fn dealloc(node: *mut Self) {
        unsafe { drop(Box::from_raw(node)) };
    }
}

/// Treiber stack with an elimination-backoff layer.
///
/// A push and a pop that collide on the top CAS pair off through the
/// elimination array instead of retrying against the center; under
/// contention a matched pair completes without either touching `top`.
///
/// `pop`/`peek` clone the element: a racing pop may have read `top` before
/// ours succeeded and still be inspecting the node.
pub struct EbStack<T, G: Guard> {
    top: AtomicPtr<StackNode<T>>,
    array: EliminationArray<StackNode<T>>,
    guard: G,
}

impl<T, G> EbStack<T, G>
where
    T: Clone,
    G: Guard,
{
    pub fn new() -> Self {
        Self::with_elimination_size(DEFAULT_ELIMINATION_SIZE)
    }

    pub fn with_elimination_size(size: usize) -> Self {
        EbStack {
            top: AtomicPtr::new(ptr::null_mut()),
            array: EliminationArray::new(size),
            guard: G::default(),
        }
    }

    pub fn push(&self, value: T) {
        let _guard = G::pin();
        let node = StackNode::alloc(value);
        let mut backoff = Backoff::new();

        loop {
            let old_top = self.top.load(Ordering::Acquire);
            // The node is still private; linking it is a plain write
            unsafe { (*node).next = old_top };

            if self
                .top
                .compare_exchange(old_top, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            if self.array.try_add(node, backoff.next_window()) {
                // Handed to a concurrent pop
                return;
            }
        }
    }

    /// Pop the top element, or `None` when the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let _guard = G::pin();
        let mut backoff = Backoff::new();

        loop {
            let old_top = self.top.load(Ordering::Acquire);
            if old_top.is_null() {
                return None;
            }

            let next = unsafe { (*old_top).next };
            if self
                .top
                .compare_exchange(old_top, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let value = unsafe { (*old_top).data.clone() };
                unsafe { self.guard.defer_destroy(old_top, StackNode::dealloc) };
                return Some(value);
            }

            if let Some(node) = self.array.try_remove(backoff.next_window()) {
                // Never published: move the value out
                return Some(unsafe { StackNode::into_data(node) });
            }
        }
    }

    pub fn peek(&self) -> Option<T> {
        let _guard = G::pin();
        let top = self.top.load(Ordering::Acquire);
        if top.is_null() {
            return None;
        }
        Some(unsafe { (*top).data.clone() })
    }

    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }
}

impl<T, G> Default for EbStack<T, G>
where
    T: Clone,
    G: Guard,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, G: Guard> Drop for EbStack<T, G> {
    fn drop(&mut self) {
        let mut curr = self.top.load(Ordering::Acquire);
        while !curr.is_null() {
            let next = unsafe { (*curr).next };
            unsafe { StackNode::dealloc(curr) };
            curr = next;
        }
    }
}
