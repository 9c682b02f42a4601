pub mod common_tests;
pub mod data_structures;
pub mod guard;

// Re-export guard types for convenience
pub use guard::{DeferredGuard, DeferredRef, Guard};
