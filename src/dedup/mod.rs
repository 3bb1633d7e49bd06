//! Duplicate removal over one record set.
//!
//! Provides:
//! - `Deduplicator`: identity, exact-hash and fuzzy strategies
//! - `CompletenessMerger`: fold duplicate groups into their most complete record

mod completeness;
mod strategy;

pub use completeness::*;
pub use strategy::*;
