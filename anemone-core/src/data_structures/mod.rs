//! Lock-free concurrent data structures.
//!
//! # Organization
//!
//! - [`sorted`] - Harris-style ordered linked list
//! - [`hash`] - split-ordered hash set layered on the list
//! - [`deque`] - anchor-based deque, plain and elimination-backed
//! - [`stack`] - elimination-backoff Treiber stack
//! - [`elimination`] - the elimination arrays behind both
//! - [`mcas`] - multi-word CAS and the threaded BST
//! - [`internal`] - shared implementation details
//!
//! Collections are generic over a guard type `G: Guard`:
//!
//! ```ignore
//! use anemone_core::{DeferredGuard, OrderedList, SortedCollection};
//!
//! let list: OrderedList<i32, DeferredGuard> = OrderedList::new();
//! list.insert(42);
//! ```

pub mod deque;
pub mod elimination;
pub mod hash;
pub(crate) mod internal;
pub mod mcas;
pub mod sorted;
pub mod stack;

// Re-exports for convenience
pub use deque::{EbDeque, LockFreeDeque};
pub use elimination::{AdaptiveEliminationArray, EliminationArray, EliminationBackend};
pub use hash::{SetEntry, SplitOrderedSet};
pub use mcas::{mcas, mcas_read, BsTree, McasUpdate, McasWord};
pub use sorted::{ListNodePosition, OrderedList};
pub use stack::EbStack;

// MarkedPtr stays pub(crate): truly an implementation detail
pub(crate) use internal::MarkedPtr;
pub use internal::{CollectionNode, NodePosition, SortedCollection, SortedCollectionIter};
