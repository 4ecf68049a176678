//! Shared data model for the Treeline indexing engine.

pub mod paths;
pub mod types;

pub use types::*;
