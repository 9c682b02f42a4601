use std::cmp::Ordering as CmpOrdering;

use crate::guard::Guard;

use super::multi_cas::{mcas, mcas_read, McasUpdate, McasWord};

/// Bit 0 tags a child word as a thread pointer: a link to the in-order
/// neighbour instead of a subtree. Compatible with the MCAS engine, which
/// reserves bits 1-2 only.
const THREAD_TAG: usize = 0b1;

fn is_thread(word: usize) -> bool {
    word & THREAD_TAG != 0
}

fn thread_to<K, V>(node: *mut TreeNode<K, V>) -> usize {
    node as usize | THREAD_TAG
}

fn node_of<K, V>(word: usize) -> *mut TreeNode<K, V> {
    (word & !THREAD_TAG) as *mut TreeNode<K, V>
}

/// Tree node. `value`, `left` and `right` are MCAS words: every
/// structural mutation goes through a transaction, and a zero in any of
/// them marks the node as mid-deletion (readers retry from the root).
struct TreeNode<K, V> {
    key: Option<K>,
    /// *mut V, or 0 while the node is being deleted
    value: McasWord,
    /// Child word: real node (tag clear) or thread pointer (tag set)
    left: McasWord,
    right: McasWord,
    _marker: std::marker::PhantomData<V>,
}

impl<K, V> TreeNode<K, V> {
    fn alloc(key: Option<K>, value: usize) -> *mut Self {
        Box::into_raw(Box::new(TreeNode {
            key,
            value: McasWord::new(value),
            left: McasWord::new(0),
            right: McasWord::new(0),
            _marker: std::marker::PhantomData,
        }))
    }
}

unsafe fn dealloc_node<K, V>(ptr: *mut TreeNode<K, V>) {
    unsafe { drop(Box::from_raw(ptr)) };
}

unsafe fn dealloc_value<V>(ptr: *mut V) {
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Unbalanced threaded binary search tree built on multi-word CAS, after
/// Fraser's "Practical lock-freedom".
///
/// Child slots that would be empty in a plain BST instead hold thread
/// pointers to the in-order predecessor/successor, which bounds the
/// structural disturbance of a removal: every case is a single MCAS over
/// 4-8 words. Readers cooperate with in-flight transactions through
/// `mcas_read` and retry from the root when they cross a link that was
/// nulled by a concurrent removal.
///
/// The tree hangs off the root sentinel's left word; min/max dummy nodes
/// bound the thread pointers of the range ends.
pub struct BsTree<K, V, G: Guard> {
    root: Box<TreeNode<K, V>>,
    min_dummy: *mut TreeNode<K, V>,
    max_dummy: *mut TreeNode<K, V>,
    guard: G,
}

unsafe impl<K: Send + Sync, V: Send + Sync, G: Guard> Send for BsTree<K, V, G> {}
unsafe impl<K: Send + Sync, V: Send + Sync, G: Guard> Sync for BsTree<K, V, G> {}

impl<K, V, G> BsTree<K, V, G>
where
    K: Ord,
    V: Clone,
    G: Guard,
{
    pub fn new() -> Self {
        BsTree {
            root: Box::new(TreeNode {
                key: None,
                value: McasWord::new(0),
                left: McasWord::new(0),
                right: McasWord::new(0),
                _marker: std::marker::PhantomData,
            }),
            min_dummy: TreeNode::alloc(None, 0),
            max_dummy: TreeNode::alloc(None, 0),
            guard: G::default(),
        }
    }

    fn root_ptr(&self) -> *mut TreeNode<K, V> {
        &*self.root as *const TreeNode<K, V> as *mut TreeNode<K, V>
    }

    pub fn is_empty(&self) -> bool {
        let _pin = G::pin();
        mcas_read(&self.guard, &self.root.left) == 0
    }

    /// Walk from the root to the node holding `key`, or to the thread
    /// pointer where it would be spliced in.
    ///
    /// Returns (parent, current-word). current is 0 for an empty tree, a
    /// node pointer on a key match, or a thread word otherwise.
    fn search(&self, key: &K) -> (*mut TreeNode<K, V>, usize) {
        'retry: loop {
            let mut parent = self.root_ptr();
            let mut current = mcas_read(&self.guard, &self.root.left);

            if current == 0 {
                return (parent, 0);
            }

            while !is_thread(current) {
                let node = current as *mut TreeNode<K, V>;
                let node_key = unsafe { (*node).key.as_ref() }.expect("interior node has a key");

                let child = match key.cmp(node_key) {
                    CmpOrdering::Less => mcas_read(&self.guard, unsafe { &(*node).left }),
                    CmpOrdering::Greater => mcas_read(&self.guard, unsafe { &(*node).right }),
                    CmpOrdering::Equal => return (parent, current),
                };

                // A nulled link: the node is being torn down, retry
                if child == 0 {
                    continue 'retry;
                }

                parent = node;
                current = child;
            }

            // The thread may lead back to a node with this key when a
            // restructure raced us; retry to find it via its parent.
            let target = node_of::<K, V>(current);
            if target != self.min_dummy && target != self.max_dummy {
                let target_key =
                    unsafe { (*target).key.as_ref() }.expect("thread target has a key");
                if target_key == key {
                    continue 'retry;
                }
            }

            return (parent, current);
        }
    }

    /// Look up a key.
    pub fn find(&self, key: &K) -> Option<V> {
        let _pin = G::pin();
        let (_, current) = self.search(key);
        if current == 0 || is_thread(current) {
            return None;
        }

        let node = current as *mut TreeNode<K, V>;
        let value = mcas_read(&self.guard, unsafe { &(*node).value }) as *mut V;
        if value.is_null() {
            // Caught mid-deletion
            return None;
        }
        Some(unsafe { (*value).clone() })
    }

    /// Insert a key or replace its value. Returns the previous value when
    /// the key was already present.
    pub fn update(&self, key: K, value: V) -> Option<V> {
        let _pin = G::pin();
        let value_ptr = Box::into_raw(Box::new(value)) as usize;
        // One node allocation reused across retries
        let node = TreeNode::<K, V>::alloc(Some(key), value_ptr);

        'retry: loop {
            let key = unsafe { (*node).key.as_ref() }.expect("fresh node has a key");
            let (parent, current) = self.search(key);

            if current == 0 {
                // Empty tree: the first node's threads span the whole range
                unsafe {
                    (*node).left.store_init(thread_to(self.min_dummy));
                    (*node).right.store_init(thread_to(self.max_dummy));
                }
                if mcas(
                    &self.guard,
                    &[McasUpdate {
                        word: &self.root.left,
                        expected: 0,
                        new: node as usize,
                    }],
                ) {
                    return None;
                }
                continue 'retry;
            }

            if !is_thread(current) {
                // Key exists: swap the value word
                let existing = current as *mut TreeNode<K, V>;
                loop {
                    let old = mcas_read(&self.guard, unsafe { &(*existing).value });
                    if old == 0 {
                        // The node is being deleted; start over
                        continue 'retry;
                    }
                    if unsafe { (*existing).value.cas(old, value_ptr) } {
                        let old_ptr = old as *mut V;
                        let previous = unsafe { (*old_ptr).clone() };
                        unsafe {
                            self.guard.defer_destroy(old_ptr, dealloc_value);
                            // The pre-allocated shell was never published
                            dealloc_node(node);
                        }
                        return Some(previous);
                    }
                }
            }

            // Splice a new leaf in place of the thread pointer
            let parent_key =
                unsafe { (*parent).key.as_ref() }.expect("splice parent has a key");
            let target = node_of::<K, V>(current);

            if parent_key < key {
                // New right child of parent
                if target != self.max_dummy {
                    let target_key =
                        unsafe { (*target).key.as_ref() }.expect("thread target has a key");
                    if target_key < key {
                        continue 'retry;
                    }
                }
                unsafe {
                    (*node).left.store_init(thread_to(parent));
                    (*node).right.store_init(current);
                }
                if mcas(
                    &self.guard,
                    &[McasUpdate {
                        word: unsafe { &(*parent).right },
                        expected: current,
                        new: node as usize,
                    }],
                ) {
                    return None;
                }
            } else {
                // New left child of parent
                if target != self.min_dummy {
                    let target_key =
                        unsafe { (*target).key.as_ref() }.expect("thread target has a key");
                    if target_key > key {
                        continue 'retry;
                    }
                }
                unsafe {
                    (*node).left.store_init(current);
                    (*node).right.store_init(thread_to(parent));
                }
                if mcas(
                    &self.guard,
                    &[McasUpdate {
                        word: unsafe { &(*parent).left },
                        expected: current,
                        new: node as usize,
                    }],
                ) {
                    return None;
                }
            }
        }
    }

    /// Remove a key, returning its value.
    ///
    /// Four configurations by whether each child is a thread or a real
    /// subtree, each mirrored for the branch of the parent the victim
    /// hangs from. The affected words (the victim's three words plus the
    /// parent/neighbour links) change in a single MCAS; a failed
    /// transaction means the neighbourhood moved and the removal retries.
    pub fn remove(&self, key: &K) -> Option<V> {
        let _pin = G::pin();

        'retry: loop {
            let (parent, current) = self.search(key);
            if current == 0 || is_thread(current) {
                return None;
            }
            let victim = current as *mut TreeNode<K, V>;

            let left = mcas_read(&self.guard, unsafe { &(*victim).left });
            let right = mcas_read(&self.guard, unsafe { &(*victim).right });
            let value = mcas_read(&self.guard, unsafe { &(*victim).value });
            if left == 0 || right == 0 || value == 0 {
                // Another removal owns this node
                continue 'retry;
            }

            // Which child of the parent is the victim?
            let victim_is_left = parent == self.root_ptr()
                || unsafe { (*parent).key.as_ref() }.expect("parent has a key") > key;

            let committed = unsafe {
                match (is_thread(left), is_thread(right)) {
                    (false, false) => {
                        self.remove_with_two_subtrees(parent, victim, left, right, value, victim_is_left)
                    }
                    (true, false) => {
                        self.remove_with_right_subtree(parent, victim, left, right, value, victim_is_left)
                    }
                    (false, true) => {
                        self.remove_with_left_subtree(parent, victim, left, right, value, victim_is_left)
                    }
                    (true, true) => {
                        self.remove_leaf(parent, victim, left, right, value, victim_is_left)
                    }
                }
            };

            if !committed {
                continue 'retry;
            }

            let value_ptr = value as *mut V;
            let removed = unsafe { (*value_ptr).clone() };
            unsafe {
                self.guard.defer_destroy(value_ptr, dealloc_value);
                self.guard.defer_destroy(victim, dealloc_node);
            }
            return Some(removed);
        }
    }

    /// Rightmost node of the subtree under `child`: the victim's in-order
    /// predecessor and its parent. Fails on a nulled link.
    unsafe fn predecessor_of(
        &self,
        victim: *mut TreeNode<K, V>,
        child: usize,
    ) -> Option<(*mut TreeNode<K, V>, *mut TreeNode<K, V>)> {
        let mut grand = victim;
        let mut pred = victim;
        let mut cursor = child;
        while !is_thread(cursor) {
            grand = pred;
            pred = cursor as *mut TreeNode<K, V>;
            cursor = mcas_read(&self.guard, unsafe { &(*pred).right });
            if cursor == 0 {
                return None;
            }
        }
        Some((pred, grand))
    }

    /// Leftmost node of the subtree under `child`: the in-order successor
    /// and its parent.
    unsafe fn successor_of(
        &self,
        victim: *mut TreeNode<K, V>,
        child: usize,
    ) -> Option<(*mut TreeNode<K, V>, *mut TreeNode<K, V>)> {
        let mut grand = victim;
        let mut succ = victim;
        let mut cursor = child;
        while !is_thread(cursor) {
            grand = succ;
            succ = cursor as *mut TreeNode<K, V>;
            cursor = mcas_read(&self.guard, unsafe { &(*succ).left });
            if cursor == 0 {
                return None;
            }
        }
        Some((succ, grand))
    }

    /// Both children are threads: unhook the leaf, leaving the parent a
    /// thread to the neighbour the leaf was already threaded to.
    unsafe fn remove_leaf(
        &self,
        parent: *mut TreeNode<K, V>,
        victim: *mut TreeNode<K, V>,
        left: usize,
        right: usize,
        value: usize,
        victim_is_left: bool,
    ) -> bool {
        let parent_word = if victim_is_left {
            unsafe { &(*parent).left }
        } else {
            unsafe { &(*parent).right }
        };
        // A left child's left thread aims at the parent's predecessor, a
        // right child's right thread at its successor.
        let bypass = if victim_is_left { left } else { right };

        mcas(
            &self.guard,
            &[
                McasUpdate { word: unsafe { &(*victim).left }, expected: left, new: 0 },
                McasUpdate { word: unsafe { &(*victim).right }, expected: right, new: 0 },
                McasUpdate { word: unsafe { &(*victim).value }, expected: value, new: 0 },
                McasUpdate { word: parent_word, expected: victim as usize, new: bypass },
            ],
        )
    }

    /// Only the right child is real: lift it, rethreading the successor's
    /// left thread down to the victim's left thread.
    unsafe fn remove_with_right_subtree(
        &self,
        parent: *mut TreeNode<K, V>,
        victim: *mut TreeNode<K, V>,
        left: usize,
        right: usize,
        value: usize,
        victim_is_left: bool,
    ) -> bool {
        let Some((succ, _)) = (unsafe { self.successor_of(victim, right) }) else {
            return false;
        };
        let parent_word = if victim_is_left {
            unsafe { &(*parent).left }
        } else {
            unsafe { &(*parent).right }
        };

        mcas(
            &self.guard,
            &[
                McasUpdate { word: unsafe { &(*victim).left }, expected: left, new: 0 },
                McasUpdate { word: unsafe { &(*victim).right }, expected: right, new: 0 },
                McasUpdate { word: unsafe { &(*victim).value }, expected: value, new: 0 },
                McasUpdate {
                    word: unsafe { &(*succ).left },
                    expected: thread_to(victim),
                    new: left,
                },
                McasUpdate { word: parent_word, expected: victim as usize, new: right },
            ],
        )
    }

    /// Only the left child is real: mirror case.
    unsafe fn remove_with_left_subtree(
        &self,
        parent: *mut TreeNode<K, V>,
        victim: *mut TreeNode<K, V>,
        left: usize,
        right: usize,
        value: usize,
        victim_is_left: bool,
    ) -> bool {
        let Some((pred, _)) = (unsafe { self.predecessor_of(victim, left) }) else {
            return false;
        };
        let parent_word = if victim_is_left {
            unsafe { &(*parent).left }
        } else {
            unsafe { &(*parent).right }
        };

        mcas(
            &self.guard,
            &[
                McasUpdate { word: unsafe { &(*victim).left }, expected: left, new: 0 },
                McasUpdate { word: unsafe { &(*victim).right }, expected: right, new: 0 },
                McasUpdate { word: unsafe { &(*victim).value }, expected: value, new: 0 },
                McasUpdate {
                    word: unsafe { &(*pred).right },
                    expected: thread_to(victim),
                    new: right,
                },
                McasUpdate { word: parent_word, expected: victim as usize, new: left },
            ],
        )
    }

    /// Both children are real. The victim hanging off the parent's left
    /// branch is replaced by its successor; off the right branch by its
    /// predecessor. The non-adjacent variants also rewire the promoted
    /// node's old parent.
    unsafe fn remove_with_two_subtrees(
        &self,
        parent: *mut TreeNode<K, V>,
        victim: *mut TreeNode<K, V>,
        left: usize,
        right: usize,
        value: usize,
        victim_is_left: bool,
    ) -> bool {
        let Some((pred, pred_parent)) = (unsafe { self.predecessor_of(victim, left) }) else {
            return false;
        };
        let Some((succ, succ_parent)) = (unsafe { self.successor_of(victim, right) }) else {
            return false;
        };

        if victim_is_left {
            // Promote the successor into the victim's place
            let mut updates = vec![
                McasUpdate { word: unsafe { &(*victim).left }, expected: left, new: 0 },
                McasUpdate { word: unsafe { &(*victim).right }, expected: right, new: 0 },
                McasUpdate { word: unsafe { &(*victim).value }, expected: value, new: 0 },
                McasUpdate {
                    word: unsafe { &(*succ).left },
                    expected: thread_to(victim),
                    new: left,
                },
                McasUpdate {
                    word: unsafe { &(*parent).left },
                    expected: victim as usize,
                    new: succ as usize,
                },
                McasUpdate {
                    word: unsafe { &(*pred).right },
                    expected: thread_to(victim),
                    new: thread_to(succ),
                },
            ];

            if succ as usize != right {
                // The successor sat deeper in the right subtree: its old
                // parent takes over its right child (or a thread to it).
                let succ_right = mcas_read(&self.guard, unsafe { &(*succ).right });
                updates.push(McasUpdate {
                    word: unsafe { &(*succ).right },
                    expected: succ_right,
                    new: right,
                });
                updates.push(McasUpdate {
                    word: unsafe { &(*succ_parent).left },
                    expected: succ as usize,
                    new: if is_thread(succ_right) {
                        thread_to(succ)
                    } else {
                        succ_right
                    },
                });
            }

            mcas(&self.guard, &updates)
        } else {
            // Promote the predecessor
            let mut updates = vec![
                McasUpdate { word: unsafe { &(*victim).left }, expected: left, new: 0 },
                McasUpdate { word: unsafe { &(*victim).right }, expected: right, new: 0 },
                McasUpdate { word: unsafe { &(*victim).value }, expected: value, new: 0 },
                McasUpdate {
                    word: unsafe { &(*succ).left },
                    expected: thread_to(victim),
                    new: thread_to(pred),
                },
                McasUpdate {
                    word: unsafe { &(*parent).right },
                    expected: victim as usize,
                    new: pred as usize,
                },
                McasUpdate {
                    word: unsafe { &(*pred).right },
                    expected: thread_to(victim),
                    new: right,
                },
            ];

            if pred as usize != left {
                let pred_left = mcas_read(&self.guard, unsafe { &(*pred).left });
                updates.push(McasUpdate {
                    word: unsafe { &(*pred).left },
                    expected: pred_left,
                    new: left,
                });
                updates.push(McasUpdate {
                    word: unsafe { &(*pred_parent).right },
                    expected: pred as usize,
                    new: if is_thread(pred_left) {
                        thread_to(pred)
                    } else {
                        pred_left
                    },
                });
            }

            mcas(&self.guard, &updates)
        }
    }
}

impl<K, V, G> Default for BsTree<K, V, G>
where
    K: Ord,
    V: Clone,
    G: Guard,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, G: Guard> BsTree<K, V, G> {
    fn drop_subtree(word: usize) {
        if word == 0 || is_thread(word) {
            return;
        }
        let node = word as *mut TreeNode<K, V>;
        unsafe {
            Self::drop_subtree((*node).left.load_plain());
            Self::drop_subtree((*node).right.load_plain());
            let value = (*node).value.load_plain() as *mut V;
            if !value.is_null() {
                dealloc_value(value);
            }
            dealloc_node(node);
        }
    }
}

impl<K, V, G: Guard> Drop for BsTree<K, V, G> {
    fn drop(&mut self) {
        Self::drop_subtree(self.root.left.load_plain());
        unsafe {
            dealloc_node(self.min_dummy);
            dealloc_node(self.max_dummy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::DeferredGuard;
    use std::sync::Arc;
    use std::thread;

    type Tree = BsTree<i64, i64, DeferredGuard>;

    #[test]
    fn test_empty_tree() {
        let tree = Tree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.find(&1), None);
        assert_eq!(tree.remove(&1), None);
    }

    #[test]
    fn test_insert_find_update() {
        let tree = Tree::new();

        assert_eq!(tree.update(5, 50), None);
        assert_eq!(tree.update(3, 30), None);
        assert_eq!(tree.update(8, 80), None);
        assert!(!tree.is_empty());

        assert_eq!(tree.find(&5), Some(50));
        assert_eq!(tree.find(&3), Some(30));
        assert_eq!(tree.find(&8), Some(80));
        assert_eq!(tree.find(&7), None);

        // Replacing returns the old value
        assert_eq!(tree.update(5, 55), Some(50));
        assert_eq!(tree.find(&5), Some(55));
    }

    #[test]
    fn test_remove_leaf() {
        let tree = Tree::new();
        tree.update(5, 50);
        tree.update(3, 30);
        tree.update(8, 80);

        assert_eq!(tree.remove(&3), Some(30));
        assert_eq!(tree.find(&3), None);
        assert_eq!(tree.find(&5), Some(50));
        assert_eq!(tree.find(&8), Some(80));
    }

    #[test]
    fn test_remove_node_with_one_subtree() {
        let tree = Tree::new();
        for (k, v) in [(5, 50), (3, 30), (2, 20), (8, 80), (9, 90)] {
            tree.update(k, v);
        }

        // 3 has only a left child, 8 only a right child
        assert_eq!(tree.remove(&3), Some(30));
        assert_eq!(tree.remove(&8), Some(80));

        assert_eq!(tree.find(&2), Some(20));
        assert_eq!(tree.find(&5), Some(50));
        assert_eq!(tree.find(&9), Some(90));
        assert_eq!(tree.find(&3), None);
        assert_eq!(tree.find(&8), None);
    }

    #[test]
    fn test_remove_node_with_two_subtrees() {
        let tree = Tree::new();
        for k in [50, 30, 70, 20, 40, 60, 80, 35, 45, 65, 85] {
            tree.update(k, k * 10);
        }

        assert_eq!(tree.remove(&30), Some(300));
        assert_eq!(tree.remove(&70), Some(700));

        for k in [50, 20, 40, 60, 80, 35, 45, 65, 85] {
            assert_eq!(tree.find(&k), Some(k * 10), "missing key {}", k);
        }
        assert_eq!(tree.find(&30), None);
        assert_eq!(tree.find(&70), None);
    }

    #[test]
    fn test_remove_root_repeatedly() {
        let tree = Tree::new();
        for k in 0..64 {
            tree.update(k, k);
        }
        for k in 0..64 {
            assert_eq!(tree.remove(&k), Some(k));
        }
        assert!(tree.is_empty());

        // Reusable after draining
        assert_eq!(tree.update(7, 70), None);
        assert_eq!(tree.find(&7), Some(70));
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        let tree = Arc::new(Tree::new());
        let num_threads: i64 = 8;
        let per_thread: i64 = 500;

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let key = t * per_thread + i;
                        assert_eq!(tree.update(key, key), None);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for key in 0..num_threads * per_thread {
            assert_eq!(tree.find(&key), Some(key), "missing key {}", key);
        }
    }

    #[test]
    fn test_concurrent_insert_remove_churn() {
        let tree = Arc::new(Tree::new());

        // A stable backbone that must survive the churn
        for k in (0..1000).step_by(2) {
            tree.update(k, k);
        }

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for round in 0..200 {
                        let key = 1 + 2 * ((t * 200 + round) % 500) as i64;
                        tree.update(key, key);
                        tree.find(&key);
                        tree.remove(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for k in (0..1000).step_by(2) {
            assert_eq!(tree.find(&k), Some(k), "backbone key {} lost", k);
        }
    }
}
