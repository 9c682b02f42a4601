//! Generic test bodies shared between guard implementations.
//!
//! The deferred-guard integration tests in this crate and the epoch-guard
//! tests in `anemone-crossbeam` drive the same scenarios through these
//! functions, so a guard swap cannot silently change semantics.
