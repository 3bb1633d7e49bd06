//! Error types for harvest.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (not found, invalid input, auth)
//! - I^B materialized: Infrastructure failures (network, timeout, throttling)
//! - K_i violated: Contract violations (resuming an operation never started)

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for harvest.
///
/// Raised only for store-level failures and contract violations. Per-key fetch
/// failures travel inline as [`FetchError`] inside a fetch outcome.
#[derive(Debug, Error)]
pub enum HarvestError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("No saved progress for operation '{0}'")]
    OperationNotFound(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Bulk transform '{name}' failed: {message}")]
    Transform { name: String, message: String },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Operation '{0}' was never started or loaded")]
    OperationNotStarted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single fetch against an external source.
///
/// The variant decides retry behaviour: transient faults are retried by the
/// retry policy, permanent faults surface immediately as the key's result.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    // Transient
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited by source")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error (status {status}): {message}")]
    Server { status: u16, message: String },

    // Permanent
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation rejected: {0}")]
    Validation(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Fetch task failed: {0}")]
    TaskFailed(String),
}

impl FetchError {
    /// Check if this error is a transient fault worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }

    /// Get the source's retry delay hint, if it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl HarvestError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for harvest.
pub type Result<T> = std::result::Result<T, HarvestError>;
