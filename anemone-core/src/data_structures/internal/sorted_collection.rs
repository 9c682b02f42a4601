use crate::guard::Guard;
use std::marker::PhantomData;
use std::ptr;

pub trait CollectionNode<T> {
    fn key(&self) -> &T;

    /// Deallocate this node.
    ///
    /// # Safety
    /// - The pointer must have been allocated by the collection that created it
    /// - Must only be called once
    /// - Node must not be accessed after this call
    unsafe fn dealloc_ptr(ptr: *mut Self)
    where
        Self: Sized,
    {
        // SAFETY: caller must ensure ptr was allocated with Box::new
        unsafe { drop(Box::from_raw(ptr)) };
    }
}

/// A position in a sorted collection: the node plus the predecessor that
/// led to it.
///
/// Positions let a caller restart a search mid-list. The split-ordered
/// hash set relies on this: every operation enters the shared list at its
/// bucket's dummy node instead of the head.
pub trait NodePosition<T>: Clone {
    type Node: CollectionNode<T>;

    /// Get the node pointer at this position (None if empty/invalid)
    fn node(&self) -> Option<*mut Self::Node>;

    /// Get the node pointer, returning null if no node
    fn node_ptr(&self) -> *mut Self::Node {
        self.node().unwrap_or(ptr::null_mut())
    }

    /// Create an empty/invalid position
    fn empty() -> Self;

    /// Create a position from just a node pointer
    fn from_node(node: *mut Self::Node) -> Self;

    /// Check if this position has a valid node
    fn is_valid(&self) -> bool {
        self.node().is_some()
    }
}

/// A sorted collection of unique elements with position-hinted entry
/// points and a guard-protected safe API.
///
/// The `*_from_internal` methods are the raw algorithm: they take an
/// optional starting position and return raw node positions. The safe
/// methods pin a read guard, delegate, and route removed nodes through
/// the collection's stored guard.
pub trait SortedCollection<T: Eq + Ord> {
    type Guard: Guard;
    type Node: CollectionNode<T>;
    type NodePosition: NodePosition<T, Node = Self::Node>;

    fn insert_from_internal(
        &self,
        key: T,
        position: Option<&Self::NodePosition>,
    ) -> Option<Self::NodePosition>;

    fn remove_from_internal(
        &self,
        position: Option<&Self::NodePosition>,
        key: &T,
    ) -> Option<Self::NodePosition>;

    fn find_from_internal(
        &self,
        position: Option<&Self::NodePosition>,
        key: &T,
        is_match: bool,
    ) -> Option<Self::NodePosition>;

    /// Read-only membership test from a position.
    ///
    /// The default delegates to `find_from_internal`. Implementations that
    /// can answer without writing (wait-free) should override.
    fn contains_from_internal(&self, position: Option<&Self::NodePosition>, key: &T) -> bool {
        self.find_from_internal(position, key, true).is_some()
    }

    /// Apply a function on a specific node's element.
    fn apply_on_internal<F, R>(&self, node: *mut Self::Node, f: F) -> Option<R>
    where
        F: FnOnce(&T) -> R;

    /// Get the first unmarked data node (skips the sentinel).
    fn first_node_internal(&self) -> Option<*mut Self::Node>;

    /// Get the next unmarked node after the given node.
    fn next_node_internal(&self, node: *mut Self::Node) -> Option<*mut Self::Node>;

    /// The shared guard instance used for deferred destruction.
    fn guard(&self) -> &Self::Guard;

    // =========================================================================
    // Safe Public API (uses guard for memory safety)
    // =========================================================================

    /// Insert a value. Returns `false` if it already exists.
    fn insert(&self, key: T) -> bool {
        let _guard = Self::Guard::pin();
        self.insert_from_internal(key, None).is_some()
    }

    /// Remove a value. Returns `false` if not found.
    fn delete(&self, key: &T) -> bool {
        let _guard = Self::Guard::pin();
        if let Some(pos) = self.remove_from_internal(None, key) {
            unsafe {
                self.guard()
                    .defer_destroy(pos.node_ptr(), Self::Node::dealloc_ptr);
            }
            true
        } else {
            false
        }
    }

    /// Remove and return the value if it exists.
    fn remove(&self, key: &T) -> Option<T>
    where
        T: Clone,
    {
        let _guard = Self::Guard::pin();
        let pos = self.remove_from_internal(None, key)?;
        let node_ptr = pos.node_ptr();

        // Clone rather than move: a concurrent reader that loaded the node
        // before the unlink may still be dereferencing it.
        let data = self.apply_on_internal(node_ptr, |entry| entry.clone());

        unsafe {
            self.guard()
                .defer_destroy(node_ptr, Self::Node::dealloc_ptr);
        }

        data
    }

    /// Check if a value exists. Wait-free when the implementation
    /// overrides `contains_from_internal` with a read-only pass.
    fn contains(&self, key: &T) -> bool {
        let _guard = Self::Guard::pin();
        self.contains_from_internal(None, key)
    }

    /// Find and return a guarded reference to the value.
    fn find(&self, key: &T) -> Option<<Self::Guard as Guard>::GuardedRef<'_, T>> {
        let _guard = Self::Guard::pin();
        let pos = self.find_from_internal(None, key, true)?;

        let data_ptr = self.apply_on_internal(pos.node_ptr(), |entry| entry as *const T)?;

        // Safety: make_ref creates its own guard protecting the access
        unsafe { Some(Self::Guard::make_ref(data_ptr)) }
    }

    /// Find a value and apply a function to it.
    fn find_and_apply<F, R>(&self, key: &T, f: F) -> Option<R>
    where
        F: FnOnce(&T) -> R,
    {
        let _guard = Self::Guard::pin();
        match self.find_from_internal(None, key, true) {
            Some(pos) => self.apply_on_internal(pos.node_ptr(), f),
            None => None,
        }
    }

    fn is_empty(&self) -> bool {
        let _guard = Self::Guard::pin();
        self.first_node_internal().is_none()
    }

    /// Collect all elements into a Vec. Weakly consistent snapshot.
    fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let _guard = Self::Guard::pin();
        let mut result = Vec::new();
        let mut current = self.first_node_internal();
        while let Some(node) = current {
            unsafe {
                result.push((*node).key().clone());
            }
            current = self.next_node_internal(node);
        }
        result
    }

    /// Count elements by traversal. Weakly consistent.
    fn len(&self) -> usize {
        let _guard = Self::Guard::pin();
        let mut count = 0;
        let mut current = self.first_node_internal();
        while let Some(node) = current {
            count += 1;
            current = self.next_node_internal(node);
        }
        count
    }
}

// ============================================================================
// Iterator Support
// ============================================================================

/// Iterator over a sorted collection with guard protection.
///
/// Holds a read guard for the duration of iteration. Weakly consistent:
/// elements inserted or removed concurrently may or may not be observed.
pub struct SortedCollectionIter<'a, T, C>
where
    C: SortedCollection<T>,
    T: Eq + Ord,
{
    _guard: <C::Guard as Guard>::ReadGuard,
    collection: &'a C,
    current_node: Option<*mut C::Node>,
    _phantom: PhantomData<T>,
}

impl<'a, T, C> SortedCollectionIter<'a, T, C>
where
    C: SortedCollection<T>,
    T: Eq + Ord,
{
    pub fn new(collection: &'a C) -> Self {
        let guard = C::Guard::pin();
        let first = collection.first_node_internal();
        Self {
            _guard: guard,
            collection,
            current_node: first,
            _phantom: PhantomData,
        }
    }
}

impl<T, C> Iterator for SortedCollectionIter<'_, T, C>
where
    C: SortedCollection<T>,
    T: Eq + Ord + Clone,
{
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current_node?;

        self.current_node = self.collection.next_node_internal(node);

        // Safe: the read guard protects the node for the iterator's lifetime
        unsafe { Some((*node).key().clone()) }
    }
}
