//! Hash-based collections.

pub mod split_ordered_set;

pub use split_ordered_set::{SetEntry, SplitOrderedSet};
