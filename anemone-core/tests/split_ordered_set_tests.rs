use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use anemone_core::data_structures::SplitOrderedSet;
use anemone_core::DeferredGuard;

type Set = SplitOrderedSet<usize, DeferredGuard>;

// Four threads each fill a disjoint 1000-key range; afterwards the size
// counter and every membership query must agree.
#[test]
fn test_four_threads_disjoint_ranges() {
    let set = Arc::new(Set::new());
    let num_threads = 4;
    let per_thread = 1000;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                for i in t * per_thread..(t + 1) * per_thread {
                    assert!(set.add(i), "duplicate add for {}", i);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(set.len(), num_threads * per_thread);
    for i in 0..num_threads * per_thread {
        assert!(set.contains(&i), "missing {}", i);
    }
}

#[test]
fn test_concurrent_same_keys_single_winner() {
    let set = Arc::new(Set::new());
    let num_threads = 8;
    let keys = 500;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                let mut wins = 0usize;
                for i in 0..keys {
                    if set.add(i) {
                        wins += 1;
                    }
                }
                wins
            })
        })
        .collect();

    let total_wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // Every key was added exactly once across all threads
    assert_eq!(total_wins, keys);
    assert_eq!(set.len(), keys);
}

#[test]
fn test_growth_at_load_threshold() {
    // With expected size 64 and load factor 0.75, the first growth
    // happens at 49 entries (2^6 buckets * 0.75 + 1); entries inserted
    // around the boundary must stay reachable.
    let set: SplitOrderedSet<usize, DeferredGuard> = SplitOrderedSet::with_expected_size(64);

    for i in 0..48 {
        assert!(set.add(i));
    }
    for i in 0..48 {
        assert!(set.contains(&i));
    }

    // Cross the threshold
    for i in 48..200 {
        assert!(set.add(i));
    }
    for i in 0..200 {
        assert!(set.contains(&i), "missing {} across the growth boundary", i);
    }

    // Everything removable afterwards
    for i in 0..200 {
        assert!(set.remove(&i), "failed to remove {}", i);
    }
    assert_eq!(set.len(), 0);
}

#[test]
fn test_add_remove_round_trip() {
    let set = Set::new();
    for i in 0..100 {
        set.add(i);
    }

    let before: HashSet<usize> = set.iter().collect();

    assert!(set.add(1000));
    assert!(set.remove(&1000));

    let after: HashSet<usize> = set.iter().collect();
    assert_eq!(before, after);
}

#[test]
fn test_mixed_random_workload() {
    let set = Arc::new(Set::new());
    let num_threads = 8;
    let ops = 10_000;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                for _ in 0..ops {
                    let key = rand::random::<u64>() as usize % 2000;
                    match rand::random::<u64>() as usize % 3 {
                        0 => {
                            set.add(key);
                        }
                        1 => {
                            set.remove(&key);
                        }
                        _ => {
                            set.contains(&key);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // At quiescence the weak counter equals actual membership
    assert_eq!(set.len(), set.iter().count());
}

#[test]
fn test_removed_keys_stay_gone() {
    let set = Arc::new(Set::new());

    for i in 0..2000 {
        set.add(i);
    }

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                for i in (t * 500)..((t + 1) * 500) {
                    assert!(set.remove(&i));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..2000 {
        assert!(!set.contains(&i), "{} still present after removal", i);
    }
    assert_eq!(set.len(), 0);
}

#[test]
fn test_iteration_is_weakly_consistent() {
    let set = Arc::new(Set::new());
    for i in 0..1000 {
        set.add(i);
    }

    let writer = {
        let set = Arc::clone(&set);
        thread::spawn(move || {
            for i in 1000..2000 {
                set.add(i);
                set.remove(&(i - 1000));
            }
        })
    };

    // Iterating mid-churn must neither crash nor yield dummies or
    // duplicates.
    for _ in 0..20 {
        let snapshot: Vec<usize> = set.iter().collect();
        let unique: HashSet<usize> = snapshot.iter().copied().collect();
        assert_eq!(snapshot.len(), unique.len(), "duplicate keys in snapshot");
        for &key in &snapshot {
            assert!(key < 2000);
        }
    }

    writer.join().unwrap();

    let final_set: HashSet<usize> = set.iter().collect();
    assert_eq!(final_set, (1000..2000).collect::<HashSet<usize>>());
}
