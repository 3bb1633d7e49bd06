//! Fetch pool: bounded-concurrency acquisition of keyed records.

mod fetcher;

pub use fetcher::*;
