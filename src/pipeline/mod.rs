//! Pipeline module - resumable acquisition and multi-source consolidation.

mod acquire;
mod consolidate;

pub use acquire::*;
pub use consolidate::*;
