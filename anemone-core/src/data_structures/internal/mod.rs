//! Internal implementation details.

pub(crate) mod backoff;
pub mod marked_ptr;
pub mod sorted_collection;

pub(crate) use marked_ptr::MarkedPtr;
// Public for external wrappers such as the epoch-guarded collections
pub use sorted_collection::CollectionNode;
pub use sorted_collection::NodePosition;
pub use sorted_collection::SortedCollection;
pub use sorted_collection::SortedCollectionIter;
