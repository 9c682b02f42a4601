use crate::data_structures::elimination::{
    AdaptiveEliminationArray, EliminationArray, EliminationBackend, DEFAULT_ELIMINATION_SIZE,
};
use crate::data_structures::internal::backoff::Backoff;
use crate::guard::Guard;

use super::lock_free_deque::{DequeIter, DequeNode, LockFreeDeque, PopAttempt, PushAttempt};

/// Elimination-backoff deque.
///
/// Same algorithm and semantics as [`LockFreeDeque`], but every failed
/// anchor CAS spends its backoff window in an elimination array for the
/// matching end instead of spinning: a push that pairs with a concurrent
/// pop hands its node over directly and neither touches the anchor.
pub struct EbDeque<T, G: Guard> {
    deque: LockFreeDeque<T, G>,
    left_array: Box<dyn EliminationBackend<DequeNode<T>>>,
    right_array: Box<dyn EliminationBackend<DequeNode<T>>>,
}

fn elimination_for<T: 'static>(size: isize) -> Box<dyn EliminationBackend<DequeNode<T>>> {
    if size > 0 {
        Box::new(EliminationArray::new(size as usize))
    } else {
        // Non-positive size selects the adaptive variant
        Box::new(AdaptiveEliminationArray::default())
    }
}

impl<T, G> EbDeque<T, G>
where
    T: Clone + 'static,
    G: Guard,
{
    pub fn new() -> Self {
        Self::with_elimination_size(DEFAULT_ELIMINATION_SIZE as isize)
    }

    /// `size` slots per end; a size <= 0 selects the adaptive array.
    pub fn with_elimination_size(size: isize) -> Self {
        EbDeque {
            deque: LockFreeDeque::new(),
            left_array: elimination_for(size),
            right_array: elimination_for(size),
        }
    }

    pub fn push_left(&self, value: T) {
        let _guard = G::pin();
        let node = DequeNode::alloc(value);
        let mut backoff = Backoff::new();
        loop {
            match self.deque.push_left_attempt(node) {
                PushAttempt::Done => return,
                PushAttempt::Contended => {
                    if self.left_array.try_add(node, backoff.next_window()) {
                        // A concurrent pop took the node
                        return;
                    }
                }
            }
        }
    }

    pub fn push_right(&self, value: T) {
        let _guard = G::pin();
        let node = DequeNode::alloc(value);
        let mut backoff = Backoff::new();
        loop {
            match self.deque.push_right_attempt(node) {
                PushAttempt::Done => return,
                PushAttempt::Contended => {
                    if self.right_array.try_add(node, backoff.next_window()) {
                        return;
                    }
                }
            }
        }
    }

    pub fn pop_left(&self) -> Option<T> {
        let _guard = G::pin();
        let mut backoff = Backoff::new();
        loop {
            match self.deque.pop_left_attempt() {
                PopAttempt::Empty => return None,
                PopAttempt::Popped(value) => return Some(value),
                PopAttempt::Contended => {
                    if let Some(node) = self.left_array.try_remove(backoff.next_window()) {
                        // The node never reached the anchor; take it whole
                        return Some(unsafe { DequeNode::into_data(node) });
                    }
                }
            }
        }
    }

    pub fn pop_right(&self) -> Option<T> {
        let _guard = G::pin();
        let mut backoff = Backoff::new();
        loop {
            match self.deque.pop_right_attempt() {
                PopAttempt::Empty => return None,
                PopAttempt::Popped(value) => return Some(value),
                PopAttempt::Contended => {
                    if let Some(node) = self.right_array.try_remove(backoff.next_window()) {
                        return Some(unsafe { DequeNode::into_data(node) });
                    }
                }
            }
        }
    }

    pub fn peek_left(&self) -> Option<T> {
        self.deque.peek_left()
    }

    pub fn peek_right(&self) -> Option<T> {
        self.deque.peek_right()
    }

    pub fn len(&self) -> usize {
        self.deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    pub fn clear(&self) {
        self.deque.clear()
    }

    pub fn iter(&self) -> DequeIter<'_, T, G> {
        self.deque.iter()
    }
}

impl<T, G> Default for EbDeque<T, G>
where
    T: Clone + 'static,
    G: Guard,
{
    fn default() -> Self {
        Self::new()
    }
}
