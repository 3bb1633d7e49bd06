//! harvest - Resumable bulk acquisition and key-indexed consolidation of
//! records from rate-limited sources.
//!
//! ## Architecture
//!
//! harvest has two halves:
//! - **Acquisition**: Fetch one record per key under a sliding-window rate
//!   gate, bounded concurrency and retry, checkpointing progress so an
//!   interrupted run resumes without refetching
//! - **Consolidation**: Dedup each source, index by business key, combine
//!   sources by priority, then dedup the merged set
//!
//! ## Pipelines
//!
//! - **Acquisition**: Load or start operation → Fetch chunks → Mark → Checkpoint
//! - **Consolidation**: Dedup → Index → Combine → Residual dedup
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Source uncertainties (rate limits, retry, backoff)

pub mod cache;
pub mod checkpoint;
pub mod client;
pub mod dedup;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod transform;

// Re-exports for convenience
pub use cache::{DiskCache, MemoryCache, RecordCache};
pub use checkpoint::{CheckpointBackend, CheckpointStore, DirectoryBackend, MemoryBackend};
pub use client::{AsyncRateGate, HttpSource, RateGate, RateLimit, RetryPolicy};
pub use dedup::{CompletenessMerger, DedupStrategy, Deduplicator};
pub use merge::{Combiner, FieldPriority, SourceIndex};
pub use models::{Config, FetchError, HarvestError, KeyFields, Record, Result};
pub use pipeline::{Acquisition, AcquisitionReport, ConsolidationReport, Consolidator};
pub use pool::BoundedFetcher;
pub use transform::{BulkTransform, CpuTransform, FallbackTransform};
