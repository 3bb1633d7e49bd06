//! Checkpoint module for resumable acquisition.
//!
//! Provides:
//! - `OperationState`: Durable state document of one operation
//! - `CheckpointBackend`: Directory and in-memory artifact storage
//! - `CheckpointStore`: Exactly-once key transitions with atomic snapshots

mod backend;
mod state;
mod store;

pub use backend::*;
pub use state::*;
pub use store::*;
