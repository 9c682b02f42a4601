use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::guard::Guard;

/// Anchor status. Not STABLE means a push is mid-flight and the new end
/// node's back-link may still be stale; stabilisation is owed by whoever
/// observes it.
pub(crate) const STABLE: u8 = 0;
pub(crate) const RPUSH: u8 = 1;
pub(crate) const LPUSH: u8 = 2;

pub struct DequeNode<T> {
    data: T,
    left: AtomicPtr<DequeNode<T>>,
    right: AtomicPtr<DequeNode<T>>,
}

impl<T> DequeNode<T> {
    pub(crate) fn alloc(data: T) -> *mut Self {
        Box::into_raw(Box::new(DequeNode {
            data,
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Take the value out of a node that was never published.
    ///
    /// # Safety
    /// The caller must exclusively own `node`: either it never left this
    /// thread, or ownership arrived through an elimination-slot CAS.
    pub(crate) unsafe fn into_data(node: *mut Self) -> T {
        let boxed = unsafe { Box::from_raw(node) };
        boxed.data
    }

    unsafe fn dealloc(node: *mut Self) {
        unsafe { drop(Box::from_raw(node)) };
    }
}

/// The whole deque state: one immutable record swapped by CAS.
///
/// `status` is the single mutable field; stabilisation CASes it back to
/// STABLE in place, everything else changes by replacing the anchor.
struct Anchor<T> {
    left: *mut DequeNode<T>,
    right: *mut DequeNode<T>,
    status: AtomicU8,
    len: usize,
}

impl<T> Anchor<T> {
    fn alloc(
        left: *mut DequeNode<T>,
        right: *mut DequeNode<T>,
        status: u8,
        len: usize,
    ) -> *mut Self {
        Box::into_raw(Box::new(Anchor {
            left,
            right,
            status: AtomicU8::new(status),
            len,
        }))
    }

    unsafe fn dealloc(anchor: *mut Self) {
        unsafe { drop(Box::from_raw(anchor)) };
    }

    /// CAS status back to STABLE once the back-link repair is done.
    fn stabilize_status(&self, expected: u8) {
        let _ = self.status.compare_exchange(
            expected,
            STABLE,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

/// Outcome of a single push attempt against the central anchor.
pub(crate) enum PushAttempt {
    Done,
    Contended,
}

/// Outcome of a single pop attempt against the central anchor.
pub(crate) enum PopAttempt<T> {
    Empty,
    Popped(T),
    Contended,
}

/// Lock-free double-ended queue after Maged Michael's "CAS-Based Lock-Free
/// Algorithm for Shared Deques".
///
/// A doubly-linked chain of nodes hangs off a single atomic anchor cell
/// holding {left end, right end, status, count}. Pushes install a new end
/// together with a non-STABLE status, then repair the one back-link that
/// could not be written atomically and restore STABLE. Every operation is
/// linearized at its anchor CAS.
///
/// `pop`/`peek` clone the element: a reader that loaded the old anchor may
/// still be dereferencing the node being popped.
pub struct LockFreeDeque<T, G: Guard> {
    anchor: AtomicPtr<Anchor<T>>,
    guard: G,
}

impl<T, G> LockFreeDeque<T, G>
where
    T: Clone,
    G: Guard,
{
    pub fn new() -> Self {
        LockFreeDeque {
            anchor: AtomicPtr::new(Anchor::alloc(ptr::null_mut(), ptr::null_mut(), STABLE, 0)),
            guard: G::default(),
        }
    }

    /// Weakly consistent length from the current anchor.
    pub fn len(&self) -> usize {
        let _guard = G::pin();
        unsafe { (*self.anchor.load(Ordering::Acquire)).len }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peek_left(&self) -> Option<T> {
        let _guard = G::pin();
        let anchor = unsafe { &*self.anchor.load(Ordering::Acquire) };
        if anchor.left.is_null() {
            return None;
        }
        Some(unsafe { (*anchor.left).data.clone() })
    }

    pub fn peek_right(&self) -> Option<T> {
        let _guard = G::pin();
        let anchor = unsafe { &*self.anchor.load(Ordering::Acquire) };
        if anchor.right.is_null() {
            return None;
        }
        Some(unsafe { (*anchor.right).data.clone() })
    }

    pub fn push_left(&self, value: T) {
        let _guard = G::pin();
        let node = DequeNode::alloc(value);
        loop {
            if let PushAttempt::Done = self.push_left_attempt(node) {
                return;
            }
        }
    }

    pub fn push_right(&self, value: T) {
        let _guard = G::pin();
        let node = DequeNode::alloc(value);
        loop {
            if let PushAttempt::Done = self.push_right_attempt(node) {
                return;
            }
        }
    }

    pub fn pop_left(&self) -> Option<T> {
        let _guard = G::pin();
        loop {
            match self.pop_left_attempt() {
                PopAttempt::Empty => return None,
                PopAttempt::Popped(value) => return Some(value),
                PopAttempt::Contended => {}
            }
        }
    }

    pub fn pop_right(&self) -> Option<T> {
        let _guard = G::pin();
        loop {
            match self.pop_right_attempt() {
                PopAttempt::Empty => return None,
                PopAttempt::Popped(value) => return Some(value),
                PopAttempt::Contended => {}
            }
        }
    }

    /// One push attempt at the left end. Helping a mid-flight push is not
    /// contention; only a lost anchor CAS reports `Contended`.
    pub(crate) fn push_left_attempt(&self, node: *mut DequeNode<T>) -> PushAttempt {
        loop {
            let old = self.anchor.load(Ordering::Acquire);
            let anchor = unsafe { &*old };

            if anchor.left.is_null() {
                // Empty deque: the node becomes both ends
                let fresh = Anchor::alloc(node, node, STABLE, 1);
                return self.swap_anchor(old, fresh);
            }

            match anchor.status.load(Ordering::Acquire) {
                STABLE => {
                    // Link the new node towards the old left end; its
                    // back-link is repaired by stabilisation.
                    unsafe { (*node).right.store(anchor.left, Ordering::Release) };

                    let fresh = Anchor::alloc(node, anchor.right, LPUSH, anchor.len + 1);
                    if self.try_swap(old, fresh) {
                        unsafe {
                            self.guard.defer_destroy(old, Anchor::dealloc);
                            // fresh stays valid under the caller's pin even
                            // if it is replaced and retired right away
                            self.stabilize_left(&*fresh);
                        }
                        return PushAttempt::Done;
                    }
                    return PushAttempt::Contended;
                }
                _ => self.stabilize(anchor),
            }
        }
    }

    pub(crate) fn push_right_attempt(&self, node: *mut DequeNode<T>) -> PushAttempt {
        loop {
            let old = self.anchor.load(Ordering::Acquire);
            let anchor = unsafe { &*old };

            if anchor.right.is_null() {
                let fresh = Anchor::alloc(node, node, STABLE, 1);
                return self.swap_anchor(old, fresh);
            }

            match anchor.status.load(Ordering::Acquire) {
                STABLE => {
                    unsafe { (*node).left.store(anchor.right, Ordering::Release) };

                    let fresh = Anchor::alloc(anchor.left, node, RPUSH, anchor.len + 1);
                    if self.try_swap(old, fresh) {
                        unsafe {
                            self.guard.defer_destroy(old, Anchor::dealloc);
                            self.stabilize_right(&*fresh);
                        }
                        return PushAttempt::Done;
                    }
                    return PushAttempt::Contended;
                }
                _ => self.stabilize(anchor),
            }
        }
    }

    pub(crate) fn pop_left_attempt(&self) -> PopAttempt<T> {
        loop {
            let old = self.anchor.load(Ordering::Acquire);
            let anchor = unsafe { &*old };

            if anchor.left.is_null() {
                return PopAttempt::Empty;
            }

            if anchor.left == anchor.right {
                // Single element
                let fresh = Anchor::alloc(ptr::null_mut(), ptr::null_mut(), STABLE, 0);
                if self.try_swap(old, fresh) {
                    let value = unsafe { (*anchor.left).data.clone() };
                    self.retire(anchor.left, old);
                    return PopAttempt::Popped(value);
                }
                return PopAttempt::Contended;
            }

            match anchor.status.load(Ordering::Acquire) {
                STABLE => {
                    let prev = unsafe { (*anchor.left).right.load(Ordering::Acquire) };
                    debug_assert!(!prev.is_null(), "STABLE chain must be complete");

                    let fresh = Anchor::alloc(prev, anchor.right, STABLE, anchor.len - 1);
                    if self.try_swap(old, fresh) {
                        // Null the back-link so the removed node does not
                        // keep the live chain reachable (breaks the cycle
                        // for reclamation).
                        let _ = unsafe {
                            (*prev).left.compare_exchange(
                                anchor.left,
                                ptr::null_mut(),
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                        };
                        let value = unsafe { (*anchor.left).data.clone() };
                        self.retire(anchor.left, old);
                        return PopAttempt::Popped(value);
                    }
                    return PopAttempt::Contended;
                }
                _ => self.stabilize(anchor),
            }
        }
    }

    pub(crate) fn pop_right_attempt(&self) -> PopAttempt<T> {
        loop {
            let old = self.anchor.load(Ordering::Acquire);
            let anchor = unsafe { &*old };

            if anchor.right.is_null() {
                return PopAttempt::Empty;
            }

            if anchor.left == anchor.right {
                let fresh = Anchor::alloc(ptr::null_mut(), ptr::null_mut(), STABLE, 0);
                if self.try_swap(old, fresh) {
                    let value = unsafe { (*anchor.right).data.clone() };
                    self.retire(anchor.right, old);
                    return PopAttempt::Popped(value);
                }
                return PopAttempt::Contended;
            }

            match anchor.status.load(Ordering::Acquire) {
                STABLE => {
                    let prev = unsafe { (*anchor.right).left.load(Ordering::Acquire) };
                    debug_assert!(!prev.is_null(), "STABLE chain must be complete");

                    let fresh = Anchor::alloc(anchor.left, prev, STABLE, anchor.len - 1);
                    if self.try_swap(old, fresh) {
                        let _ = unsafe {
                            (*prev).right.compare_exchange(
                                anchor.right,
                                ptr::null_mut(),
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                        };
                        let value = unsafe { (*anchor.right).data.clone() };
                        self.retire(anchor.right, old);
                        return PopAttempt::Popped(value);
                    }
                    return PopAttempt::Contended;
                }
                _ => self.stabilize(anchor),
            }
        }
    }
}

impl<T, G: Guard> LockFreeDeque<T, G> {
    /// CAS the anchor and retire the old record, freeing the speculative
    /// one on failure.
    fn swap_anchor(&self, old: *mut Anchor<T>, fresh: *mut Anchor<T>) -> PushAttempt {
        if self.try_swap(old, fresh) {
            unsafe {
                self.guard.defer_destroy(old, Anchor::dealloc);
            }
            PushAttempt::Done
        } else {
            PushAttempt::Contended
        }
    }

    fn try_swap(&self, old: *mut Anchor<T>, fresh: *mut Anchor<T>) -> bool {
        match self
            .anchor
            .compare_exchange(old, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                // Never published
                unsafe { Anchor::dealloc(fresh) };
                false
            }
        }
    }

    /// Retire a popped node and the replaced anchor.
    fn retire(&self, node: *mut DequeNode<T>, old_anchor: *mut Anchor<T>) {
        unsafe {
            self.guard.defer_destroy(node, DequeNode::dealloc);
            self.guard.defer_destroy(old_anchor, Anchor::dealloc);
        }
    }

    fn stabilize(&self, anchor: &Anchor<T>) {
        match anchor.status.load(Ordering::Acquire) {
            RPUSH => self.stabilize_right(anchor),
            LPUSH => self.stabilize_left(anchor),
            _ => {}
        }
    }

    /// Finish a left push: the old left end's back-link may still bypass
    /// the new node. Idempotent; any observer may run it.
    fn stabilize_left(&self, anchor: &Anchor<T>) {
        if anchor.status.load(Ordering::Acquire) != LPUSH {
            return;
        }
        let prev = unsafe { (*anchor.left).right.load(Ordering::Acquire) };
        if prev.is_null() {
            return;
        }
        let prev_left = unsafe { (*prev).left.load(Ordering::Acquire) };
        if prev_left != anchor.left {
            if anchor.status.load(Ordering::Acquire) != LPUSH {
                return;
            }
            if unsafe {
                (*prev)
                    .left
                    .compare_exchange(prev_left, anchor.left, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
            } {
                return;
            }
        }
        anchor.stabilize_status(LPUSH);
    }

    fn stabilize_right(&self, anchor: &Anchor<T>) {
        if anchor.status.load(Ordering::Acquire) != RPUSH {
            return;
        }
        let prev = unsafe { (*anchor.right).left.load(Ordering::Acquire) };
        if prev.is_null() {
            return;
        }
        let prev_right = unsafe { (*prev).right.load(Ordering::Acquire) };
        if prev_right != anchor.right {
            if anchor.status.load(Ordering::Acquire) != RPUSH {
                return;
            }
            if unsafe {
                (*prev)
                    .right
                    .compare_exchange(prev_right, anchor.right, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
            } {
                return;
            }
        }
        anchor.stabilize_status(RPUSH);
    }

    /// Remove every element. The chain is stabilised first so it can be
    /// walked end to end for retirement.
    pub fn clear(&self) {
        let _guard = G::pin();
        loop {
            let old = self.anchor.load(Ordering::Acquire);
            let anchor = unsafe { &*old };

            if anchor.left.is_null() {
                return;
            }
            if anchor.status.load(Ordering::Acquire) != STABLE {
                self.stabilize(anchor);
                continue;
            }

            let fresh = Anchor::alloc(ptr::null_mut(), ptr::null_mut(), STABLE, 0);
            if self.try_swap(old, fresh) {
                unsafe {
                    let mut curr = anchor.left;
                    loop {
                        let next = (*curr).right.load(Ordering::Acquire);
                        let at_end = curr == anchor.right;
                        self.guard.defer_destroy(curr, DequeNode::dealloc);
                        if at_end {
                            break;
                        }
                        curr = next;
                    }
                    self.guard.defer_destroy(old, Anchor::dealloc);
                }
                return;
            }
        }
    }

    /// Iterate left to right. Weakly consistent: concurrent pushes and
    /// pops may or may not be reflected.
    pub fn iter(&self) -> DequeIter<'_, T, G> {
        let guard = G::pin();
        let anchor = unsafe { &*self.anchor.load(Ordering::Acquire) };
        DequeIter {
            _guard: guard,
            cursor: anchor.left,
            end: anchor.right,
            done: anchor.left.is_null(),
            _deque: self,
        }
    }
}

pub struct DequeIter<'a, T, G>
where
    G: Guard,
{
    _guard: G::ReadGuard,
    cursor: *mut DequeNode<T>,
    end: *mut DequeNode<T>,
    done: bool,
    _deque: &'a LockFreeDeque<T, G>,
}

impl<T, G> Iterator for DequeIter<'_, T, G>
where
    T: Clone,
    G: Guard,
{
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor.is_null() {
            return None;
        }
        let value = unsafe { (*self.cursor).data.clone() };
        if self.cursor == self.end {
            self.done = true;
        } else {
            self.cursor = unsafe { (*self.cursor).right.load(Ordering::Acquire) };
        }
        Some(value)
    }
}

impl<T, G> Default for LockFreeDeque<T, G>
where
    T: Clone,
    G: Guard,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, G: Guard> Drop for LockFreeDeque<T, G> {
    fn drop(&mut self) {
        let old = self.anchor.load(Ordering::Acquire);
        unsafe {
            let anchor = &*old;
            // An interrupted RPUSH leaves the last forward link unwritten;
            // finish it so the walk below reaches the right end.
            self.stabilize(anchor);
            if !anchor.left.is_null() {
                let mut curr = anchor.left;
                loop {
                    let next = (*curr).right.load(Ordering::Acquire);
                    let at_end = curr == anchor.right;
                    DequeNode::dealloc(curr);
                    if at_end {
                        break;
                    }
                    curr = next;
                }
            }
            Anchor::dealloc(old);
        }
    }
}
