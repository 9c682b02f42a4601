use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::guard::Guard;

// Descriptor tags occupy bits 1-2 of a word. Bit 0 is left free for
// client-side tags (the threaded BST stores thread pointers there), so
// neither tag can be confused with a payload.
const CCAS_TAG: usize = 0b010;
const MCAS_TAG: usize = 0b100;

/// Bits a client payload must keep clear.
pub const RESERVED_TAG_MASK: usize = CCAS_TAG | MCAS_TAG;

const UNDECIDED: u8 = 0;
const SUCCESSFUL: u8 = 1;
const FAILED: u8 = 2;

/// Allocation-order ids give descriptors a total order over their target
/// words; address comparison alone is not stable across allocator reuse.
static NEXT_WORD_ID: AtomicU64 = AtomicU64::new(1);

/// A word that can participate in multi-word CAS transactions.
///
/// The cell holds either a client payload (any machine word with
/// [`RESERVED_TAG_MASK`] bits clear - in practice an aligned pointer,
/// optionally carrying a bit-0 tag) or a tagged descriptor pointer while a
/// transaction is mid-flight.
pub struct McasWord {
    cell: AtomicUsize,
    id: u64,
}

impl McasWord {
    pub fn new(initial: usize) -> Self {
        debug_assert_eq!(initial & RESERVED_TAG_MASK, 0);
        McasWord {
            cell: AtomicUsize::new(initial),
            id: NEXT_WORD_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Stable identity captured at construction; orders the acquire phase.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read the current payload, helping any in-flight descriptor first.
    pub fn read<G: Guard>(&self, guard: &G) -> usize {
        mcas_read(guard, self)
    }

    /// Initialise an unpublished word. Not linearized: only valid while no
    /// other thread can reach the word.
    pub(crate) fn store_init(&self, value: usize) {
        self.cell.store(value, Ordering::Release);
    }

    /// Raw load without helping. Only valid under exclusive access
    /// (drop paths), when no descriptor can be installed.
    pub(crate) fn load_plain(&self) -> usize {
        let value = self.cell.load(Ordering::Acquire);
        debug_assert_eq!(value & RESERVED_TAG_MASK, 0);
        value
    }

    /// Plain CAS on the payload. Fails (for the caller to re-read and
    /// help) when a descriptor occupies the cell.
    pub(crate) fn cas(&self, expected: usize, new: usize) -> bool {
        debug_assert_eq!(expected & RESERVED_TAG_MASK, 0);
        debug_assert_eq!(new & RESERVED_TAG_MASK, 0);
        self.cell
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One target of an MCAS transaction.
pub struct McasUpdate<'a> {
    pub word: &'a McasWord,
    pub expected: usize,
    pub new: usize,
}

struct McasEntry {
    word: *const McasWord,
    expected: usize,
    new: usize,
}

struct McasDescriptor {
    entries: Vec<McasEntry>,
    status: AtomicU8,
}

struct CcasDescriptor {
    word: *const McasWord,
    expected: usize,
    new: usize,
    cond: *const AtomicU8,
}

unsafe fn dealloc_mcas_descriptor(ptr: *mut McasDescriptor) {
    unsafe { drop(Box::from_raw(ptr)) };
}

unsafe fn dealloc_ccas_descriptor(ptr: *mut CcasDescriptor) {
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Atomically move every target from its expected to its new value, or
/// none of them. After Keir Fraser's "Practical lock-freedom".
///
/// Targets are acquired in word-id order (preventing livelock between
/// overlapping transactions), the status CAS decides the outcome in one
/// step, and the release phase is idempotent so any helper can finish a
/// stalled transaction.
///
/// Each word may appear at most once per transaction.
pub fn mcas<G: Guard>(guard: &G, updates: &[McasUpdate<'_>]) -> bool {
    let _pin = G::pin();

    let mut entries: Vec<McasEntry> = updates
        .iter()
        .map(|u| {
            debug_assert_eq!(u.expected & RESERVED_TAG_MASK, 0);
            debug_assert_eq!(u.new & RESERVED_TAG_MASK, 0);
            McasEntry {
                word: u.word as *const McasWord,
                expected: u.expected,
                new: u.new,
            }
        })
        .collect();
    entries.sort_by_key(|e| unsafe { (*e.word).id });

    let descriptor = Box::into_raw(Box::new(McasDescriptor {
        entries,
        status: AtomicU8::new(UNDECIDED),
    }));

    let outcome = unsafe { mcas_help(guard, descriptor) };

    // Helpers may still hold the descriptor; retire, never free in place.
    unsafe { guard.defer_destroy(descriptor, dealloc_mcas_descriptor) };
    outcome
}

/// Read a word, helping transactions to completion instead of observing
/// their descriptors.
pub fn mcas_read<G: Guard>(guard: &G, word: &McasWord) -> usize {
    let _pin = G::pin();
    loop {
        let value = ccas_read(word);
        if value & MCAS_TAG == 0 {
            return value;
        }
        unsafe { mcas_help(guard, (value & !MCAS_TAG) as *mut McasDescriptor) };
    }
}

/// Drive a transaction to its decision and release its targets. Called by
/// the initiator and by any thread that stumbles over the descriptor.
///
/// # Safety
/// `descriptor` must point to a live descriptor reached under an active
/// pin.
unsafe fn mcas_help<G: Guard>(guard: &G, descriptor: *mut McasDescriptor) -> bool {
    let desc = unsafe { &*descriptor };
    let tagged = descriptor as usize | MCAS_TAG;

    // Phase 1: install the descriptor at each target in id order.
    let mut desired = FAILED;
    'decision: {
        for entry in &desc.entries {
            loop {
                let word = unsafe { &*entry.word };
                ccas(guard, word, entry.expected, tagged, &desc.status);

                let value = ccas_read(word);
                if value == entry.expected && desc.status.load(Ordering::Acquire) == UNDECIDED {
                    // The CCAS lost a race but the location still holds
                    // the expected value: retry the install.
                    continue;
                }
                if value == tagged {
                    // Acquired; move to the next location
                    break;
                }
                if value & MCAS_TAG == 0 {
                    // Neither our descriptor nor the expected value nor a
                    // foreign transaction: the attempt is doomed.
                    break 'decision;
                }
                // A foreign transaction holds the word: help it, then retry
                unsafe { mcas_help(guard, (value & !MCAS_TAG) as *mut McasDescriptor) };
            }
        }
        desired = SUCCESSFUL;
    }

    // Decision point: the transaction linearizes exactly here.
    let _ = desc
        .status
        .compare_exchange(UNDECIDED, desired, Ordering::SeqCst, Ordering::SeqCst);
    let success = desc.status.load(Ordering::SeqCst) == SUCCESSFUL;

    // Phase 2: release every target. Idempotent, any helper may run it.
    for entry in &desc.entries {
        let target = if success { entry.new } else { entry.expected };
        let _ = unsafe {
            (*entry.word)
                .cell
                .compare_exchange(tagged, target, Ordering::AcqRel, Ordering::Relaxed)
        };
    }

    success
}

/// Conditional CAS: set `word := new` iff it holds `expected` AND the
/// condition still reads UNDECIDED, atomically with respect to both.
///
/// Installs a CCAS descriptor, then completes it; a reader that meets the
/// descriptor helps it and rereads. `new` here is always a tagged MCAS
/// descriptor, conditioned on that descriptor's own status.
fn ccas<G: Guard>(guard: &G, word: &McasWord, expected: usize, new: usize, cond: &AtomicU8) {
    let descriptor = Box::into_raw(Box::new(CcasDescriptor {
        word: word as *const McasWord,
        expected,
        new,
        cond: cond as *const AtomicU8,
    }));
    let tagged = descriptor as usize | CCAS_TAG;

    loop {
        match word
            .cell
            .compare_exchange(expected, tagged, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                unsafe { ccas_help(descriptor) };
                // The descriptor left the word inside ccas_help, but a
                // stalled reader may still hold it.
                unsafe { guard.defer_destroy(descriptor, dealloc_ccas_descriptor) };
                return;
            }
            Err(value) => {
                if value & CCAS_TAG == 0 {
                    // The word no longer holds the expected value; the
                    // descriptor was never shared and can be freed here.
                    unsafe { dealloc_ccas_descriptor(descriptor) };
                    return;
                }
                unsafe { ccas_help((value & !CCAS_TAG) as *mut CcasDescriptor) };
            }
        }
    }
}

/// Complete an installed CCAS descriptor: commit to `new` when the
/// condition still reads UNDECIDED, roll back to `expected` otherwise.
///
/// # Safety
/// `descriptor` must point to a live descriptor reached under an active
/// pin.
unsafe fn ccas_help(descriptor: *mut CcasDescriptor) {
    let desc = unsafe { &*descriptor };
    let commit = unsafe { (*desc.cond).load(Ordering::SeqCst) } == UNDECIDED;
    let target = if commit { desc.new } else { desc.expected };
    let tagged = descriptor as usize | CCAS_TAG;
    let _ = unsafe {
        (*desc.word)
            .cell
            .compare_exchange(tagged, target, Ordering::AcqRel, Ordering::Relaxed)
    };
}

/// Read past any CCAS descriptor, helping it out of the word first.
fn ccas_read(word: &McasWord) -> usize {
    loop {
        let value = word.cell.load(Ordering::SeqCst);
        if value & CCAS_TAG == 0 {
            return value;
        }
        unsafe { ccas_help((value & !CCAS_TAG) as *mut CcasDescriptor) };
    }
}
