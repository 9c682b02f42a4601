use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::Duration;

use super::{alloc_slots, try_add_slots, try_remove_slots, EliminationBackend};

/// Default average size for the adaptive array.
pub const DEFAULT_ADAPTIVE_SIZE: usize = 32;

/// The effective size never shrinks below this.
const MIN_SIZE: usize = 2;
/// Counters are evaluated once this many failures accumulate.
const ADJUST_CYCLE: usize = 200;

/// Elimination array that resizes its effective slot range with the match
/// rate.
///
/// Backing storage is allocated once at 2x the average size; only the
/// probed prefix changes. Every [`ADJUST_CYCLE`] failures the range is
/// halved when matches fall below a quarter of the cycle and doubled when
/// they exceed it, trading probe spread against collision rate.
///
/// The counters are racy on purpose: they steer a heuristic, and an
/// occasional lost update only delays an adjustment.
pub struct AdaptiveEliminationArray<T> {
    add_slots: Box<[AtomicPtr<T>]>,
    remove_slots: Box<[AtomicPtr<T>]>,
    /// Currently probed prefix of the slot arrays.
    size: AtomicUsize,
    matches: AtomicUsize,
    failures: AtomicUsize,
}

impl<T> AdaptiveEliminationArray<T> {
    /// `average_size` is the midpoint: the effective size varies between
    /// [`MIN_SIZE`] and `2 * average_size`.
    pub fn new(average_size: usize) -> Self {
        let average_size = average_size.max(MIN_SIZE);
        AdaptiveEliminationArray {
            add_slots: alloc_slots(average_size * 2),
            remove_slots: alloc_slots(average_size * 2),
            size: AtomicUsize::new(average_size),
            matches: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.add_slots.len()
    }

    // Probing wraps modulo the effective size, so a size below LOOKAHEAD
    // just revisits slots within one attempt.
    fn effective_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn record(&self, matched: bool) {
        if matched {
            self.matches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn adjust_size(&self) {
        if self.failures.load(Ordering::Relaxed) <= ADJUST_CYCLE {
            return;
        }

        let matches = self.matches.load(Ordering::Relaxed);
        let current = self.size.load(Ordering::Relaxed);

        let next = if matches < ADJUST_CYCLE / 4 {
            current / 2
        } else if matches > ADJUST_CYCLE {
            current * 2
        } else {
            current
        };

        self.size
            .store(next.clamp(MIN_SIZE, self.capacity()), Ordering::Relaxed);
        self.matches.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }
}

impl<T> Default for AdaptiveEliminationArray<T> {
    fn default() -> Self {
        Self::new(DEFAULT_ADAPTIVE_SIZE)
    }
}

impl<T> EliminationBackend<T> for AdaptiveEliminationArray<T> {
    fn try_add(&self, obj: *mut T, backoff: Duration) -> bool {
        self.adjust_size();
        let matched = try_add_slots(
            &self.add_slots,
            &self.remove_slots,
            self.effective_size(),
            obj,
            backoff,
        );
        self.record(matched);
        matched
    }

    fn try_remove(&self, backoff: Duration) -> Option<*mut T> {
        self.adjust_size();
        let taken = try_remove_slots(
            &self.add_slots,
            &self.remove_slots,
            self.effective_size(),
            backoff,
        );
        self.record(taken.is_some());
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_halves_on_low_match_rate() {
        let array: AdaptiveEliminationArray<usize> = AdaptiveEliminationArray::new(32);

        array.failures.store(ADJUST_CYCLE + 1, Ordering::Relaxed);
        array.matches.store(0, Ordering::Relaxed);
        array.adjust_size();

        assert_eq!(array.size.load(Ordering::Relaxed), 16);
        assert_eq!(array.failures.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_size_doubles_on_high_match_rate() {
        let array: AdaptiveEliminationArray<usize> = AdaptiveEliminationArray::new(16);

        array.failures.store(ADJUST_CYCLE + 1, Ordering::Relaxed);
        array.matches.store(ADJUST_CYCLE + 1, Ordering::Relaxed);
        array.adjust_size();

        assert_eq!(array.size.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn test_size_stays_within_bounds() {
        let array: AdaptiveEliminationArray<usize> = AdaptiveEliminationArray::new(2);

        for _ in 0..10 {
            array.failures.store(ADJUST_CYCLE + 1, Ordering::Relaxed);
            array.matches.store(0, Ordering::Relaxed);
            array.adjust_size();
        }
        assert_eq!(array.size.load(Ordering::Relaxed), MIN_SIZE);

        for _ in 0..10 {
            array.failures.store(ADJUST_CYCLE + 1, Ordering::Relaxed);
            array.matches.store(ADJUST_CYCLE + 1, Ordering::Relaxed);
            array.adjust_size();
        }
        assert_eq!(array.size.load(Ordering::Relaxed), array.capacity());
    }
}
