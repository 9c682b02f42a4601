//! Benchmarks for the core collections under epoch reclamation.
//!
//! Run with: cargo bench --package anemone-crossbeam --bench collections_benchmark

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use mimalloc::MiMalloc;
use std::sync::Arc;
use std::thread;

use anemone_core::data_structures::{EbDeque, LockFreeDeque, OrderedList, SortedCollection, SplitOrderedSet};
use anemone_crossbeam::EpochGuard;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const OPS_PER_THREAD: usize = 10_000;

type EpochList = OrderedList<i64, EpochGuard>;
type EpochSet = SplitOrderedSet<i64, EpochGuard>;

fn bench_insert_delete<C>(list: &C, count: usize)
where
    C: SortedCollection<i64>,
{
    for i in 0..count {
        list.insert(i as i64);
    }
    for i in 0..count {
        list.delete(&(i as i64));
        list.insert(i as i64);
    }
}

fn bench_concurrent_set_ops(set: Arc<EpochSet>, thread_count: usize, ops_per_thread: usize) {
    let mut handles = vec![];

    for t in 0..thread_count {
        let set = Arc::clone(&set);
        handles.push(thread::spawn(move || {
            let base = (t * ops_per_thread) as i64;
            for i in 0..ops_per_thread as i64 {
                set.add(base + i);
                set.contains(&(base + i));
                set.remove(&(base + i));
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

fn bench_deque_pairs<D: Send + Sync + 'static>(
    deque: Arc<D>,
    push: fn(&D, i64),
    pop: fn(&D) -> Option<i64>,
    thread_count: usize,
) {
    let mut handles = vec![];
    for t in 0..thread_count {
        let deque = Arc::clone(&deque);
        handles.push(thread::spawn(move || {
            if t % 2 == 0 {
                for i in 0..OPS_PER_THREAD as i64 {
                    push(&deque, i);
                }
            } else {
                let mut popped = 0;
                while popped < OPS_PER_THREAD {
                    if pop(&deque).is_some() {
                        popped += 1;
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

fn ordered_list_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_list");

    for count in [100usize, 1000] {
        group.bench_with_input(
            BenchmarkId::new("insert_delete", count),
            &count,
            |b, &count| {
                b.iter(|| {
                    let list = EpochList::new();
                    bench_insert_delete(&list, black_box(count));
                });
            },
        );
    }

    group.finish();
}

fn split_ordered_set_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_ordered_set");
    group.sample_size(10);

    for threads in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("mixed_ops", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let set = Arc::new(EpochSet::new());
                    bench_concurrent_set_ops(set, threads, OPS_PER_THREAD / threads);
                });
            },
        );
    }

    group.finish();
}

fn deque_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("deque");
    group.sample_size(10);

    for threads in [2usize, 4] {
        group.bench_with_input(
            BenchmarkId::new("central_pairs", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let deque: Arc<LockFreeDeque<i64, EpochGuard>> = Arc::new(LockFreeDeque::new());
                    bench_deque_pairs(
                        deque,
                        |d, v| d.push_left(v),
                        |d| d.pop_right(),
                        threads,
                    );
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("elimination_pairs", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let deque: Arc<EbDeque<i64, EpochGuard>> = Arc::new(EbDeque::new());
                    bench_deque_pairs(
                        deque,
                        |d, v| d.push_left(v),
                        |d| d.pop_right(),
                        threads,
                    );
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    ordered_list_benchmarks,
    split_ordered_set_benchmarks,
    deque_benchmarks
);
criterion_main!(benches);
