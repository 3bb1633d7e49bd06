//! Key-indexed merge of records from several sources.
//!
//! Provides:
//! - `SourceIndex`: Records of one source by business key
//! - `Combiner`: Priority merge of indexes with optional conflict rules
//! - `CombineStats`: Source coverage of a merged dataset
//! - `enrich` / `remap_fields`: Joins and renames around a merge

mod combine;
mod enrich;
mod index;
mod rules;

pub use combine::*;
pub use enrich::*;
pub use index::*;
pub use rules::*;
