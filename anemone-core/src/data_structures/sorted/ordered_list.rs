use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::data_structures::CollectionNode;
use crate::data_structures::MarkedPtr;
use crate::data_structures::NodePosition;
use crate::data_structures::SortedCollection;
use crate::guard::Guard;

type NodePtr<T> = *mut ListNode<T>;

/// Lock-free sorted linked list after Harris's "A Pragmatic Implementation
/// of Non-Blocking Linked-Lists", with the Michael-style cooperative unlink
/// of marked nodes during traversal.
///
/// Set semantics: no duplicate keys among unmarked nodes, keys strictly
/// increasing along the unmarked chain.
///
/// Removal is two-phase:
///   Phase 1, logical:  CAS curr.next from (succ, 0) to (succ, 1)
///   Phase 2, physical: CAS pred.next from (curr, 0) to (succ, 0)
///
/// Phase 2 may lose its race; any later traverser that sees the mark will
/// finish the unlink. The deleting thread nevertheless loops until the node
/// is confirmed out of the list before handing it to the guard, so a node
/// is never retired while still reachable.
///
/// Failed CAS during traversal restarts from the start node passed in by
/// the caller, not from HEAD. The split-ordered hash set depends on this:
/// it passes bucket dummy nodes as start positions.
#[derive(Debug)]
pub struct ListNode<T> {
    data: Option<T>,
    next: AtomicPtr<ListNode<T>>,
}

impl<T> ListNode<T> {
    fn new(key: T) -> Self {
        ListNode {
            data: Some(key),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn new_sentinel() -> Self {
        ListNode {
            data: None,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn is_sentinel(&self) -> bool {
        self.data.is_none()
    }

    /// Load next pointer (Acquire ordering)
    #[inline]
    pub(crate) fn get_next(&self) -> NodePtr<T> {
        self.next.load(Ordering::Acquire)
    }

    /// Store next pointer (Release ordering)
    #[inline]
    fn set_next(&self, ptr: NodePtr<T>) {
        self.next.store(ptr, Ordering::Release)
    }

    /// CAS next pointer (Release/Relaxed ordering)
    #[inline]
    fn cas_next(&self, expected: NodePtr<T>, new: NodePtr<T>) -> Result<NodePtr<T>, NodePtr<T>> {
        self.next
            .compare_exchange(expected, new, Ordering::Release, Ordering::Relaxed)
    }

    /// Weak CAS next pointer (Release/Relaxed ordering)
    #[inline]
    fn cas_next_weak(
        &self,
        expected: NodePtr<T>,
        new: NodePtr<T>,
    ) -> Result<NodePtr<T>, NodePtr<T>> {
        self.next
            .compare_exchange_weak(expected, new, Ordering::Release, Ordering::Relaxed)
    }
}

impl<T> CollectionNode<T> for ListNode<T> {
    fn key(&self) -> &T {
        self.data
            .as_ref()
            .expect("Cannot get key from sentinel node")
    }
}

/// (pred, curr, next) triple returned by the internal locate step.
#[derive(Debug, Copy, Clone)]
struct NodeLocation<T> {
    pub pred: NodePtr<T>,
    pub curr: NodePtr<T>,
    pub next: NodePtr<T>,
}

/// Position in an OrderedList: the node and the predecessor that reached it.
pub struct ListNodePosition<T> {
    pred: NodePtr<T>,
    node: NodePtr<T>,
}

// Manual impls to avoid requiring T: Clone/Copy
impl<T> Copy for ListNodePosition<T> {}

impl<T> Clone for ListNodePosition<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> NodePosition<T> for ListNodePosition<T> {
    type Node = ListNode<T>;

    fn node(&self) -> Option<*mut Self::Node> {
        if self.node.is_null() {
            None
        } else {
            Some(self.node)
        }
    }

    fn node_ptr(&self) -> *mut Self::Node {
        self.node
    }

    fn empty() -> Self {
        ListNodePosition {
            pred: ptr::null_mut(),
            node: ptr::null_mut(),
        }
    }

    fn from_node(node: *mut Self::Node) -> Self {
        ListNodePosition {
            pred: ptr::null_mut(),
            node,
        }
    }

    fn is_valid(&self) -> bool {
        !self.node.is_null()
    }
}

impl<T> ListNodePosition<T> {
    pub fn new(pred: NodePtr<T>, node: NodePtr<T>) -> Self {
        ListNodePosition { pred, node }
    }

    pub fn pred(&self) -> NodePtr<T> {
        self.pred
    }
}

pub struct OrderedList<T, G: Guard> {
    pub(crate) head: AtomicPtr<ListNode<T>>,
    /// Shared guard for deferred destruction of removed nodes.
    guard: G,
}

impl<T, G> OrderedList<T, G>
where
    T: Eq + Ord,
    G: Guard,
{
    pub fn new() -> Self {
        // Sentinel head node without a value.
        let head_node = Box::into_raw(Box::new(ListNode::new_sentinel()));
        OrderedList {
            head: AtomicPtr::new(head_node),
            guard: G::default(),
        }
    }

    /// Resolve the starting node for a traversal: the position's
    /// predecessor if it has one, else its node, else HEAD.
    fn start_of(position: Option<&ListNodePosition<T>>) -> Option<NodePtr<T>> {
        position.and_then(|pos| {
            let pred = pos.pred();
            if !pred.is_null() {
                Some(pred)
            } else {
                pos.node()
            }
        })
    }

    /// Unlink a marked node from the list, guaranteeing completion before
    /// returning.
    ///
    /// This MUST finish before the node is handed to the guard: retiring a
    /// node that is still reachable would let it be freed under a future
    /// traverser.
    ///
    /// Returns the final predecessor (may differ from `pred` after retries).
    ///
    /// # Safety
    /// - `marked_node` must be marked and `replacement` must be its
    ///   unmarked successor
    /// - `start_node`, when given, must be a valid traversal entry point
    unsafe fn unlink_marked_node(
        &self,
        mut pred: NodePtr<T>,
        marked_node: NodePtr<T>,
        replacement: NodePtr<T>,
        start_node: Option<NodePtr<T>>,
    ) -> NodePtr<T> {
        let key = unsafe { (*marked_node).key() };
        // Once invalidated, stays None for every later retry
        let mut start_node = start_node;

        loop {
            let cas_result = unsafe { (*pred).cas_next(marked_node, replacement) };

            if cas_result.is_ok() {
                return pred;
            }

            // CAS failed: pred was marked, something was inserted between
            // pred and marked_node, or another thread finished the unlink.
            let actual = cas_result.unwrap_err();
            let actual_ptr = MarkedPtr::unmask(actual);

            if actual_ptr != marked_node {
                if actual_ptr.is_null() {
                    // pred.next ran off the list - already unlinked
                    return pred;
                }
                let actual_key = unsafe { (*actual_ptr).key() };
                if actual_key > key {
                    // pred.next points past marked_node - already unlinked
                    return pred;
                }
                // actual_key <= key: an insert landed between pred and
                // marked_node; find the new predecessor below.
            }

            // Re-traverse to find the current predecessor of marked_node.
            // The start node is unusable if it IS the marked node or is
            // itself marked; fall back to HEAD in both cases.
            let mut start = match start_node {
                Some(s) => {
                    let s_clean = MarkedPtr::unmask(s);
                    if s_clean == marked_node {
                        start_node = None;
                        self.head.load(Ordering::Acquire)
                    } else {
                        let s_next = unsafe { (*s_clean).get_next() };
                        if MarkedPtr::new(s_next).is_marked() {
                            start_node = None;
                            self.head.load(Ordering::Acquire)
                        } else {
                            s_clean
                        }
                    }
                }
                None => self.head.load(Ordering::Acquire),
            };

            pred = start;
            let mut curr = unsafe { (*pred).get_next() };

            loop {
                curr = MarkedPtr::unmask(curr);

                if curr.is_null() {
                    // Reached the end without meeting marked_node
                    return pred;
                }

                if curr == marked_node {
                    // pred is the current predecessor, retry the CAS
                    break;
                }

                let next = unsafe { (*curr).get_next() };
                let next_marked = MarkedPtr::new(next);

                // Snip any other marked node met on the way
                if next_marked.is_marked() {
                    let snip = unsafe { (*pred).cas_next(curr, next_marked.as_ptr()) };

                    if snip.is_err() {
                        // pred may itself be marked; restart from a node
                        // that is still valid
                        let pred_next_raw = unsafe { (*pred).get_next() };
                        if MarkedPtr::new(pred_next_raw).is_marked() {
                            let start_next = unsafe { (*start).get_next() };
                            if MarkedPtr::new(start_next).is_marked() {
                                start_node = None;
                                start = self.head.load(Ordering::Acquire);
                            }
                            pred = start;
                            curr = unsafe { (*pred).get_next() };
                            continue;
                        }
                    }

                    curr = unsafe { (*pred).get_next() };
                    continue;
                }

                if !unsafe { (*curr).is_sentinel() } {
                    let curr_key = unsafe { (*curr).key() };
                    if curr_key > key {
                        // Walked past marked_node's slot - already unlinked
                        return pred;
                    }
                }

                pred = curr;
                curr = next;
            }
            // Loop back and retry the CAS with the new pred
        }
    }

    /// Locate (pred, curr, next) around the first node with key >= target,
    /// unlinking marked nodes on the way.
    ///
    /// Restarts from `head_node` (the caller's entry point) when a snip CAS
    /// fails, keeping bucket-dummy entry points valid.
    fn node_location_from_internal(
        &self,
        key: &T,
        head_node: Option<NodePtr<T>>,
    ) -> NodeLocation<T> {
        'retry: loop {
            let mut pred_node = match head_node {
                Some(start_node) => MarkedPtr::unmask(start_node),
                None => self.head.load(Ordering::Acquire),
            };

            let mut curr_node = unsafe { (*pred_node).get_next() };

            loop {
                curr_node = MarkedPtr::unmask(curr_node);

                if curr_node.is_null() {
                    return NodeLocation {
                        pred: pred_node,
                        curr: curr_node,
                        next: ptr::null_mut(),
                    };
                }

                let next_node = unsafe { (*curr_node).get_next() };
                let next_marked = MarkedPtr::new(next_node);

                if next_marked.is_marked() {
                    // curr is logically deleted: snip it out by pointing
                    // pred at its successor.
                    let snip = unsafe { (*pred_node).cas_next(curr_node, next_marked.as_ptr()) };

                    if snip.is_err() {
                        // Someone else snipped, or pred got marked.
                        continue 'retry;
                    }

                    curr_node = next_marked.as_ptr();
                } else {
                    unsafe {
                        if !(*curr_node).is_sentinel() && (*curr_node).key() >= key {
                            // Re-check the node was not marked while we
                            // looked at its key.
                            let recheck = (*curr_node).get_next();
                            if MarkedPtr::new(recheck).is_marked() {
                                continue 'retry;
                            }
                            return NodeLocation {
                                pred: pred_node,
                                curr: curr_node,
                                next: next_node,
                            };
                        }
                    }

                    pred_node = curr_node;
                    curr_node = next_marked.as_ptr();
                }
            }
        }
    }
}

impl<T, G> SortedCollection<T> for OrderedList<T, G>
where
    T: Eq + Ord,
    G: Guard,
{
    type Guard = G;
    type Node = ListNode<T>;
    type NodePosition = ListNodePosition<T>;

    fn guard(&self) -> &G {
        &self.guard
    }

    fn insert_from_internal(
        &self,
        key: T,
        position: Option<&Self::NodePosition>,
    ) -> Option<Self::NodePosition> {
        let new_node = Box::into_raw(Box::new(ListNode::new(key)));

        loop {
            let key = unsafe { (*new_node).key() };
            let start_node = Self::start_of(position);

            // The hint node itself may carry the key (duplicate via a
            // stale position).
            if let Some(hint) = start_node {
                let hint = MarkedPtr::unmask(hint);
                unsafe {
                    if !(*hint).is_sentinel() && (*hint).key() == key {
                        ListNode::dealloc_ptr(new_node);
                        return None;
                    }
                }
            }

            let loc = self.node_location_from_internal(key, start_node);
            let (pred, curr) = (loc.pred, loc.curr);

            if !curr.is_null() {
                unsafe {
                    if (*curr).key() == key {
                        ListNode::dealloc_ptr(new_node);
                        return None; // Duplicate
                    }
                }
            }

            unsafe {
                (*new_node).set_next(curr);
            }

            // Publish: pred.next (curr, 0) -> (new_node, 0)
            let result = unsafe { (*pred).cas_next_weak(curr, new_node) };

            if result.is_ok() {
                return Some(ListNodePosition::new(pred, new_node));
            }
            // CAS failed, retry
        }
    }

    fn remove_from_internal(
        &self,
        position: Option<&Self::NodePosition>,
        key: &T,
    ) -> Option<Self::NodePosition> {
        let start_node = Self::start_of(position);

        loop {
            let location = self.node_location_from_internal(key, start_node);
            let (mut pred, curr) = (location.pred, location.curr);

            if curr.is_null() {
                return None;
            }

            unsafe {
                if (*curr).key() != key {
                    return None;
                }

                pred = MarkedPtr::unmask(pred);

                let curr_next = (*curr).get_next();
                let curr_next_marked = MarkedPtr::new(curr_next);

                if curr_next_marked.is_marked() {
                    // Another thread already deleted it
                    return None;
                }

                // Phase 1: logical delete. This CAS is the linearization
                // point of a successful remove.
                let marked = curr_next_marked.with_mark(true);
                let mark_result = (*curr).cas_next_weak(curr_next, marked.as_raw());

                if mark_result.is_err() {
                    // next changed under us (new successor or a mark)
                    continue;
                }

                // Phase 2: physical unlink, completed before return so the
                // node can be safely retired.
                let successor = curr_next_marked.as_ptr();
                let final_pred = self.unlink_marked_node(pred, curr, successor, start_node);
                return Some(ListNodePosition::new(final_pred, curr));
            }
        }
    }

    fn find_from_internal(
        &self,
        position: Option<&Self::NodePosition>,
        key: &T,
        is_match: bool,
    ) -> Option<Self::NodePosition> {
        let start_node = Self::start_of(position);

        let location = self.node_location_from_internal(key, start_node);

        if location.curr.is_null() {
            return None;
        }

        let node = location.curr;

        if is_match {
            if unsafe { (*node).key() == key } {
                return Some(ListNodePosition::new(location.pred, node));
            } else {
                return None;
            }
        }

        Some(ListNodePosition::new(location.pred, location.pred))
    }

    /// Wait-free membership test: a single read-only pass.
    ///
    /// Never CASes, so it cannot be forced to retry; bounded by the list
    /// length. Marked nodes are skipped rather than unlinked.
    fn contains_from_internal(&self, position: Option<&Self::NodePosition>, key: &T) -> bool {
        let start_node = Self::start_of(position);

        let mut curr = match start_node {
            Some(s) => unsafe { (*MarkedPtr::unmask(s)).get_next() },
            None => unsafe { (*self.head.load(Ordering::Acquire)).get_next() },
        };

        loop {
            let curr_ptr = MarkedPtr::unmask(curr);
            if curr_ptr.is_null() {
                return false;
            }

            let next = unsafe { (*curr_ptr).get_next() };
            let next_marked = MarkedPtr::new(next);

            if !unsafe { (*curr_ptr).is_sentinel() } {
                match unsafe { (*curr_ptr).key() }.cmp(key) {
                    std::cmp::Ordering::Less => {}
                    std::cmp::Ordering::Equal => {
                        if !next_marked.is_marked() {
                            return true;
                        }
                        // A marked match: keep walking, the key is gone
                        // unless it was reinserted further on.
                    }
                    std::cmp::Ordering::Greater => return false,
                }
            }

            curr = next_marked.as_ptr();
        }
    }

    fn apply_on_internal<F, R>(&self, node: *mut Self::Node, f: F) -> Option<R>
    where
        F: FnOnce(&T) -> R,
    {
        let curr = MarkedPtr::unmask(node);

        if curr.is_null() {
            return None;
        }

        unsafe {
            let node_ref = &*curr;

            if node_ref.is_sentinel() {
                return None;
            }

            Some(f(node_ref.key()))
        }
    }

    fn first_node_internal(&self) -> Option<*mut Self::Node> {
        let head = self.head.load(Ordering::Acquire);
        let mut curr = unsafe { (*head).get_next() };

        while !curr.is_null() {
            let marked = MarkedPtr::new(unsafe { (*curr).get_next() });

            if !marked.is_marked() {
                return Some(curr);
            }

            curr = marked.as_ptr();
        }

        None
    }

    fn next_node_internal(&self, node: *mut Self::Node) -> Option<*mut Self::Node> {
        if node.is_null() {
            return None;
        }

        let node = MarkedPtr::unmask(node);

        unsafe {
            let mut curr = (*node).get_next();

            while !curr.is_null() {
                let marked = MarkedPtr::new(curr);
                curr = marked.as_ptr();

                if curr.is_null() {
                    return None;
                }

                let next_marked = MarkedPtr::new((*curr).get_next());
                if !next_marked.is_marked() {
                    return Some(curr);
                }

                // Node is marked, continue to next
                curr = next_marked.as_ptr();
            }
        }

        None
    }
}

impl<T, G> Default for OrderedList<T, G>
where
    T: Eq + Ord,
    G: Guard,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, G: Guard> Drop for OrderedList<T, G> {
    fn drop(&mut self) {
        let mut curr = self.head.load(Ordering::Acquire);

        while !curr.is_null() {
            unsafe {
                let next_raw = (*curr).get_next();
                let next_marked = MarkedPtr::new(next_raw);

                // A marked node still reachable at drop time means a remove
                // returned without completing its physical unlink.
                if next_marked.is_marked() && !(*curr).is_sentinel() {
                    panic!(
                        "invariant violation: marked node still linked at drop time; \
                         physical unlink must complete before a remove returns"
                    );
                }

                let next = next_marked.as_ptr();
                ListNode::dealloc_ptr(curr);

                curr = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::guard::DeferredGuard;

    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_contains_delete() {
        let list: OrderedList<i32, DeferredGuard> = OrderedList::new();

        assert!(list.insert(20));
        assert!(list.insert(10));
        assert!(list.insert(30));
        assert!(!list.insert(20));

        assert!(list.contains(&10));
        assert!(list.contains(&20));
        assert!(list.contains(&30));
        assert!(!list.contains(&15));

        assert!(list.delete(&20));
        assert!(!list.contains(&20));
        assert!(!list.delete(&20));

        assert_eq!(list.to_vec(), vec![10, 30]);
    }

    #[test]
    fn test_keys_stay_sorted() {
        let list: OrderedList<i32, DeferredGuard> = OrderedList::new();

        for i in [5, 3, 9, 1, 7, 8, 2, 6, 4, 0] {
            list.insert(i);
        }

        assert_eq!(list.to_vec(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_add_remove_round_trip_preserves_membership() {
        let list: OrderedList<i32, DeferredGuard> = OrderedList::new();

        for i in 0..20 {
            list.insert(i);
        }
        let before = list.to_vec();

        assert!(list.insert(100));
        assert!(list.delete(&100));

        assert_eq!(list.to_vec(), before);
    }

    #[test]
    fn test_recovery_from_marked_start() {
        let list: OrderedList<i32, DeferredGuard> = OrderedList::new();

        for i in 0..100 {
            list.insert(i);
        }

        let _guard = DeferredGuard::pin();
        let node_50 = list.find_from_internal(None, &50, true).unwrap();

        let deleted_node = list.remove_from_internal(None, &50);
        assert!(deleted_node.is_some());

        // A search starting from the removed node must still find 60
        let location = list.node_location_from_internal(&60, Some(node_50.node_ptr()));

        assert!(!location.curr.is_null());
        unsafe {
            assert_eq!(*(*location.curr).key(), 60);

            if let Some(pos) = deleted_node {
                ListNode::dealloc_ptr(pos.node_ptr());
            }
        }
    }

    #[test]
    fn test_contains_skips_marked_nodes() {
        let list: OrderedList<i32, DeferredGuard> = OrderedList::new();

        for i in 0..10 {
            list.insert(i);
        }
        assert!(list.delete(&5));

        assert!(!list.contains(&5));
        assert!(list.contains(&4));
        assert!(list.contains(&6));
    }

    #[test]
    fn test_concurrent_insert_delete() {
        let list: Arc<OrderedList<i32, DeferredGuard>> = Arc::new(OrderedList::new());
        let num_threads = 4;
        let operations_per_thread = 100;

        let handles: Vec<_> = (0..num_threads)
            .map(|thread_id| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for i in 0..operations_per_thread {
                        let key = thread_id * operations_per_thread + i;
                        list.insert(key);

                        if i % 10 == 0 && key > 0 {
                            list.delete(&(key - 1));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let vec = list.to_vec();
        for window in vec.windows(2) {
            assert!(window[0] < window[1], "list lost strict ordering");
        }
    }

    #[test]
    fn test_concurrent_readers_during_churn() {
        let list: Arc<OrderedList<i32, DeferredGuard>> = Arc::new(OrderedList::new());

        for i in 0..1000 {
            list.insert(i);
        }

        let handles: Vec<_> = (0..8)
            .map(|thread_id| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for i in 0..100 {
                        let key = thread_id * 100 + i;

                        if thread_id % 2 == 0 {
                            list.delete(&key);
                        } else {
                            let _ = list.contains(&key);
                        }

                        list.insert(key + 1000);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_concurrent_delete_same_key_single_winner() {
        let list: Arc<OrderedList<i32, DeferredGuard>> = Arc::new(OrderedList::new());
        list.insert(42);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let list = Arc::clone(&list);
                thread::spawn(move || list.delete(&42))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1, "exactly one delete may win");
        assert!(!list.contains(&42));
    }
}
