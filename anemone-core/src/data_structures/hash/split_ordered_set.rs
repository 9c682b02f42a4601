use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::data_structures::sorted::ordered_list::{ListNode, ListNodePosition, OrderedList};
use crate::data_structures::{NodePosition, SortedCollection, SortedCollectionIter};
use crate::guard::Guard;

/// Number of top-level directory slots.
const N_SEGMENTS: usize = 512;
/// Live bucket count starts at 2^INITIAL_BUCKET_BITS.
const INITIAL_BUCKET_BITS: u32 = 6;
const DEFAULT_EXPECTED_SIZE: usize = 500;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;
const MIN_SEGMENT_SIZE: usize = 64;

/// An entry in the split-ordered list: a bucket dummy or a real key.
///
/// The whole set lives in one sorted list; sorting by the bit-reversed
/// hash ("split order") makes every bucket a contiguous run anchored by
/// its dummy. Regular entries carry the low bit set, dummies keep it
/// clear, so a dummy sorts immediately before its bucket's entries.
#[derive(Clone, Debug)]
pub enum SetEntry<K> {
    Dummy { split_key: u32, bucket: u32 },
    Key { split_key: u32, key: K },
}

impl<K> SetEntry<K> {
    fn new_dummy(bucket: u32) -> Self {
        SetEntry::Dummy {
            split_key: bucket.reverse_bits(),
            bucket,
        }
    }

    fn new_key(hash: u32, key: K) -> Self {
        SetEntry::Key {
            split_key: hash.reverse_bits() | 1,
            key,
        }
    }

    fn split_key(&self) -> u32 {
        match self {
            SetEntry::Dummy { split_key, .. } => *split_key,
            SetEntry::Key { split_key, .. } => *split_key,
        }
    }

    /// The real key, if this is not a dummy.
    pub fn key(&self) -> Option<&K> {
        match self {
            SetEntry::Dummy { .. } => None,
            SetEntry::Key { key, .. } => Some(key),
        }
    }
}

impl<K: Eq> PartialEq for SetEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                SetEntry::Dummy { bucket: b1, .. },
                SetEntry::Dummy { bucket: b2, .. },
            ) => b1 == b2,
            (
                SetEntry::Key {
                    split_key: s1,
                    key: k1,
                },
                SetEntry::Key {
                    split_key: s2,
                    key: k2,
                },
            ) => s1 == s2 && k1 == k2,
            _ => false,
        }
    }
}

impl<K: Eq> Eq for SetEntry<K> {}

impl<K: Eq + Ord> PartialOrd for SetEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Eq + Ord> Ord for SetEntry<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Primary order: the split key as an unsigned 32-bit integer
        match self.split_key().cmp(&other.split_key()) {
            std::cmp::Ordering::Equal => match (self, other) {
                // Dummies sort before regular entries (their low bit is
                // clear, so equal split keys here means dummy vs dummy or
                // colliding regular keys)
                (SetEntry::Dummy { .. }, SetEntry::Key { .. }) => std::cmp::Ordering::Less,
                (SetEntry::Key { .. }, SetEntry::Dummy { .. }) => std::cmp::Ordering::Greater,
                (SetEntry::Dummy { bucket: b1, .. }, SetEntry::Dummy { bucket: b2, .. }) => {
                    b1.cmp(b2)
                }
                // Hash collision: fall back to the key order
                (SetEntry::Key { key: k1, .. }, SetEntry::Key { key: k2, .. }) => k1.cmp(k2),
            },
            ord => ord,
        }
    }
}

/// One lazily allocated block of the bucket directory.
struct Segment<K> {
    slots: Box<[AtomicPtr<ListNode<SetEntry<K>>>]>,
}

impl<K> Segment<K> {
    fn new(segment_size: usize) -> Self {
        let slots = (0..segment_size)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Segment { slots }
    }
}

/// Lock-free resizable hash set after Shalev and Shavit's "Split-Ordered
/// Lists: Lock-Free Extensible Hash Tables".
///
/// All entries live in a single [`OrderedList`] sorted by split-ordered
/// key. Buckets are dummy nodes inside that list; the two-level directory
/// maps a bucket index to its dummy for O(1) entry. Growing the table is a
/// single CAS on `bucket_bits` - entries never move, new dummies are
/// materialised lazily on first access, each spliced in from its parent
/// bucket `b ^ highest_set_bit(b)`.
pub struct SplitOrderedSet<K, G: Guard, S = RandomState> {
    list: OrderedList<SetEntry<K>, G>,
    segments: Box<[AtomicPtr<Segment<K>>]>,
    segment_size: usize,
    /// The live bucket count is 2^bucket_bits.
    bucket_bits: AtomicU32,
    len: AtomicUsize,
    load_factor: f32,
    hasher: S,
}

impl<K, G> SplitOrderedSet<K, G, RandomState>
where
    K: Hash + Eq + Ord + Clone,
    G: Guard,
{
    pub fn new() -> Self {
        Self::with_expected_size(DEFAULT_EXPECTED_SIZE)
    }

    pub fn with_expected_size(expected_size: usize) -> Self {
        Self::with_hasher_and_capacity(RandomState::new(), expected_size, DEFAULT_LOAD_FACTOR)
    }
}

impl<K, G> Default for SplitOrderedSet<K, G, RandomState>
where
    K: Hash + Eq + Ord + Clone,
    G: Guard,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, G, S> SplitOrderedSet<K, G, S>
where
    K: Hash + Eq + Ord + Clone,
    G: Guard,
    S: BuildHasher,
{
    pub fn with_hasher_and_capacity(hasher: S, expected_size: usize, load_factor: f32) -> Self {
        let segment_size = expected_size.max(MIN_SEGMENT_SIZE).next_power_of_two();

        let segments = (0..N_SEGMENTS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let set = SplitOrderedSet {
            list: OrderedList::new(),
            segments,
            segment_size,
            bucket_bits: AtomicU32::new(INITIAL_BUCKET_BITS),
            len: AtomicUsize::new(0),
            load_factor,
            hasher,
        };

        // Bucket 0 anchors everything; install it eagerly so parent
        // recursion always bottoms out.
        let pos = set
            .list
            .insert_from_internal(SetEntry::new_dummy(0), None)
            .expect("empty list must accept the root dummy");
        set.slot(0).store(pos.node_ptr(), Ordering::Release);

        set
    }

    fn hash_key(&self, key: &K) -> u32 {
        self.hasher.hash_one(key) as u32
    }

    fn bucket_of(&self, hash: u32) -> u32 {
        hash & ((1u32 << self.bucket_bits.load(Ordering::Acquire)) - 1)
    }

    fn max_buckets(&self) -> usize {
        N_SEGMENTS * self.segment_size
    }

    /// The parent bucket: clear the highest set bit.
    /// bucket 5 (101) -> 1 (001), bucket 6 (110) -> 2 (010).
    fn parent_bucket(bucket: u32) -> u32 {
        debug_assert!(bucket != 0);
        bucket ^ (1u32 << (31 - bucket.leading_zeros()))
    }

    /// Directory slot for a bucket, allocating its segment on first touch.
    fn slot(&self, bucket: u32) -> &AtomicPtr<ListNode<SetEntry<K>>> {
        let segment_idx = bucket as usize / self.segment_size;
        let slot_idx = bucket as usize % self.segment_size;

        assert!(
            segment_idx < N_SEGMENTS,
            "bucket {} exceeds the directory capacity",
            bucket
        );

        let slot_cell = &self.segments[segment_idx];
        let mut seg = slot_cell.load(Ordering::Acquire);
        if seg.is_null() {
            let fresh = Box::into_raw(Box::new(Segment::new(self.segment_size)));
            match slot_cell.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => seg = fresh,
                Err(winner) => {
                    // Lost the allocation race
                    unsafe { drop(Box::from_raw(fresh)) };
                    seg = winner;
                }
            }
        }

        unsafe { &(*seg).slots[slot_idx] }
    }

    /// The dummy node anchoring `bucket`, materialising it (and its parent
    /// chain) lazily.
    fn bucket_dummy(&self, bucket: u32) -> *mut ListNode<SetEntry<K>> {
        let slot = self.slot(bucket);
        let known = slot.load(Ordering::Acquire);
        if !known.is_null() {
            return known;
        }

        // Parent first; recursion bottoms out at bucket 0 which is
        // installed at construction.
        let parent_ptr = self.bucket_dummy(Self::parent_bucket(bucket));
        let parent_pos = ListNodePosition::from_node(parent_ptr);

        // Splice the dummy in from the parent's position. A racing thread
        // may win the insert; both locate the surviving dummy afterwards.
        let node = match self
            .list
            .insert_from_internal(SetEntry::new_dummy(bucket), Some(&parent_pos))
        {
            Some(pos) => pos.node_ptr(),
            None => self
                .list
                .find_from_internal(Some(&parent_pos), &SetEntry::new_dummy(bucket), true)
                .expect("bucket dummy must exist after a duplicate insert")
                .node_ptr(),
        };

        // Publish; the first writer wins, dummies are never replaced.
        let _ = slot.compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire);
        slot.load(Ordering::Acquire)
    }

    /// Double the live bucket count when the load factor is exceeded.
    /// No rehash: existing entries are already in split order.
    fn maybe_grow(&self, size: usize) {
        let bits = self.bucket_bits.load(Ordering::Acquire);
        let capacity = 1usize << bits;
        if size as f32 > capacity as f32 * self.load_factor && capacity * 2 <= self.max_buckets() {
            let _ = self.bucket_bits.compare_exchange(
                bits,
                bits + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Add a key. Returns `false` if it is already present.
    pub fn add(&self, key: K) -> bool {
        let _guard = G::pin();
        let hash = self.hash_key(&key);
        let dummy = self.bucket_dummy(self.bucket_of(hash));
        let pos = ListNodePosition::from_node(dummy);

        if self
            .list
            .insert_from_internal(SetEntry::new_key(hash, key), Some(&pos))
            .is_some()
        {
            let size = self.len.fetch_add(1, Ordering::Relaxed) + 1;
            self.maybe_grow(size);
            true
        } else {
            false
        }
    }

    /// Wait-free membership test.
    pub fn contains(&self, key: &K) -> bool {
        let _guard = G::pin();
        let hash = self.hash_key(key);
        let dummy = self.bucket_dummy(self.bucket_of(hash));
        let pos = ListNodePosition::from_node(dummy);

        self.list
            .contains_from_internal(Some(&pos), &SetEntry::new_key(hash, key.clone()))
    }

    /// Remove a key. Returns `false` if it was not present.
    pub fn remove(&self, key: &K) -> bool {
        let _guard = G::pin();
        let hash = self.hash_key(key);
        let dummy = self.bucket_dummy(self.bucket_of(hash));
        let pos = ListNodePosition::from_node(dummy);

        if let Some(removed) = self
            .list
            .remove_from_internal(Some(&pos), &SetEntry::new_key(hash, key.clone()))
        {
            self.len.fetch_sub(1, Ordering::Relaxed);
            unsafe {
                self.list
                    .guard()
                    .defer_destroy(removed.node_ptr(), crate::data_structures::CollectionNode::dealloc_ptr);
            }
            true
        } else {
            false
        }
    }

    /// Weakly consistent size: the counter is updated around each
    /// linearization point and may be off by in-flight operations.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the keys in split order, dummies filtered out.
    /// Weakly consistent: reflects some state between start and end.
    pub fn iter(&self) -> SetIter<'_, K, G> {
        SetIter {
            inner: SortedCollectionIter::new(&self.list),
        }
    }
}

pub struct SetIter<'a, K, G>
where
    K: Eq + Ord + Clone,
    G: Guard,
{
    inner: SortedCollectionIter<'a, SetEntry<K>, OrderedList<SetEntry<K>, G>>,
}

impl<K, G> Iterator for SetIter<'_, K, G>
where
    K: Eq + Ord + Clone,
    G: Guard,
{
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                SetEntry::Key { key, .. } => return Some(key),
                SetEntry::Dummy { .. } => continue,
            }
        }
    }
}

impl<K, G: Guard, S> Drop for SplitOrderedSet<K, G, S> {
    fn drop(&mut self) {
        // The list owns the nodes; only the directory blocks are ours.
        for slot in self.segments.iter() {
            let seg = slot.load(Ordering::Acquire);
            if !seg.is_null() {
                unsafe { drop(Box::from_raw(seg)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::DeferredGuard;
    use std::sync::Arc;
    use std::thread;

    type Set = SplitOrderedSet<usize, DeferredGuard>;

    #[test]
    fn test_basic_operations() {
        let set = Set::new();

        assert!(set.add(5));
        assert!(set.add(3));
        assert!(set.add(7));
        assert!(!set.add(5));

        assert!(set.contains(&5));
        assert!(set.contains(&3));
        assert!(set.contains(&7));
        assert!(!set.contains(&10));

        assert!(set.remove(&3));
        assert!(!set.contains(&3));
        assert!(!set.remove(&3));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_dummy_sorts_before_bucket_entries() {
        let dummy: SetEntry<usize> = SetEntry::new_dummy(3);
        // A key that lands in bucket 3 under any bucket_bits >= 2
        let entry: SetEntry<usize> = SetEntry::new_key(3, 99);

        assert!(dummy < entry);
    }

    #[test]
    fn test_parent_bucket() {
        assert_eq!(Set::parent_bucket(1), 0);
        assert_eq!(Set::parent_bucket(2), 0);
        assert_eq!(Set::parent_bucket(3), 1);
        assert_eq!(Set::parent_bucket(5), 1);
        assert_eq!(Set::parent_bucket(6), 2);
        assert_eq!(Set::parent_bucket(7), 3);
    }

    #[test]
    fn test_growth_keeps_entries_reachable() {
        // Small expected size so the load threshold is crossed quickly
        let set: SplitOrderedSet<usize, DeferredGuard> = SplitOrderedSet::with_expected_size(64);

        let n = 4096;
        for i in 0..n {
            assert!(set.add(i), "failed to add {}", i);
        }

        assert_eq!(set.len(), n);
        for i in 0..n {
            assert!(set.contains(&i), "missing {} after growth", i);
        }
    }

    #[test]
    fn test_iter_filters_dummies() {
        let set = Set::new();
        for i in 0..100 {
            set.add(i);
        }

        let mut seen: Vec<usize> = set.iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_size_matches_membership_at_quiescence() {
        let set = Set::new();
        for i in 0..500 {
            set.add(i);
        }
        for i in (0..500).step_by(2) {
            set.remove(&i);
        }

        assert_eq!(set.len(), 250);
        assert_eq!(set.iter().count(), 250);
    }

    #[test]
    fn test_concurrent_insertions() {
        let set = Arc::new(Set::new());
        let num_threads = 8;
        let items_per_thread = 1000;

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for i in 0..items_per_thread {
                        set.add(t * items_per_thread + i);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(set.len(), num_threads * items_per_thread);
        for i in 0..(num_threads * items_per_thread) {
            assert!(set.contains(&i), "missing key: {}", i);
        }
    }

    #[test]
    fn test_concurrent_bucket_materialisation() {
        // Same parent bucket contended by many threads at once: force
        // growth and hammer adds that all resolve fresh dummies.
        let set: Arc<SplitOrderedSet<usize, DeferredGuard>> =
            Arc::new(SplitOrderedSet::with_expected_size(64));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for i in 0..2000 {
                        set.add(t * 2000 + i);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(set.len(), 16000);
        for i in 0..16000 {
            assert!(set.contains(&i));
        }
    }
}
