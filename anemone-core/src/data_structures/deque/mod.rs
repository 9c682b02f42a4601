//! Double-ended queues over a single CAS-swapped anchor.

pub mod eb_deque;
pub mod lock_free_deque;

pub use eb_deque::EbDeque;
pub use lock_free_deque::{DequeIter, LockFreeDeque};
