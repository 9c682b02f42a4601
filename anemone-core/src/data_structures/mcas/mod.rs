//! Multi-word CAS and the structures built on it.

pub mod bs_tree;
pub mod multi_cas;

pub use bs_tree::BsTree;
pub use multi_cas::{mcas, mcas_read, McasUpdate, McasWord, RESERVED_TAG_MASK};
