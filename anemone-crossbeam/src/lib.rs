//! Crossbeam-based reclamation for anemone collections.
//!
//! This crate provides `EpochGuard`, an implementation of the `Guard`
//! trait using crossbeam-epoch.
//!
//! # Usage
//!
//! ```ignore
//! use anemone_core::data_structures::{OrderedList, SortedCollection};
//! use anemone_crossbeam::EpochGuard;
//!
//! let list: OrderedList<i32, EpochGuard> = OrderedList::new();
//! list.insert(42);
//! ```

pub mod epoch_guard;

pub use epoch_guard::{EpochGuard, EpochRef};
