//! Operation state persisted by the checkpoint store.
//!
//! Epistemic foundation:
//! - K_i: Every key given to `start` is either completed or still pending
//! - K_i: The state document is the commit point of a snapshot
//! - B_i: Partial results may run ahead of the state document → truncated on load

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::Record;

/// Lifecycle of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Never started
    New,
    /// Started, nothing flushed since the first snapshot
    Running,
    /// At least one checkpoint written after start
    Checkpointed,
    /// Every key completed
    Completed,
    /// Cancelled; in-flight keys stay pending
    Interrupted,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Checkpointed => "checkpointed",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// A key that completed with a terminal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// A successful fetch result kept until the operation is consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub key: String,
    pub record: Record,
}

/// Durable state document of one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationState {
    /// Sanitized operation name
    pub operation: String,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<DateTime<Utc>>,
    /// Every key given to `start`, input order, no duplicates
    pub keys: Vec<String>,
    /// Completed keys in completion order (includes failures)
    pub completed: Vec<String>,
    #[serde(default)]
    pub failures: Vec<KeyFailure>,
    /// Number of partial results committed with this document
    pub partial_results_count: usize,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl OperationState {
    pub fn new(operation: &str, keys: Vec<String>, metadata: serde_json::Map<String, Value>) -> Self {
        Self {
            operation: operation.to_string(),
            status: OperationStatus::Running,
            started_at: Utc::now(),
            last_checkpoint: None,
            keys,
            completed: Vec::new(),
            failures: Vec::new(),
            partial_results_count: 0,
            metadata,
        }
    }

    pub fn total(&self) -> usize {
        self.keys.len()
    }

    pub fn remaining(&self) -> usize {
        self.keys.len().saturating_sub(self.completed.len())
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Get completion percentage.
    pub fn completion_percent(&self) -> f64 {
        if self.keys.is_empty() {
            return 100.0;
        }
        (self.completed.len() as f64 / self.keys.len() as f64) * 100.0
    }

    /// Summary without the key lists.
    pub fn info(&self) -> ProgressInfo {
        ProgressInfo {
            operation: self.operation.clone(),
            status: self.status,
            total: self.total(),
            completed: self.completed.len(),
            failed: self.failures.len(),
            remaining: self.remaining(),
            completion_percent: self.completion_percent(),
            started_at: self.started_at,
            last_checkpoint: self.last_checkpoint,
            partial_results_count: self.partial_results_count,
            metadata: self.metadata.clone(),
        }
    }
}

/// Saved progress of an operation, read without loading partial results.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressInfo {
    pub operation: String,
    pub status: OperationStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub completion_percent: f64,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub partial_results_count: usize,
    pub metadata: serde_json::Map<String, Value>,
}

/// Live counters of the in-memory operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressStats {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
    pub completion_percent: f64,
    /// Completions not yet flushed
    pub since_checkpoint: usize,
}

/// Map an operation name onto a storage-safe name.
///
/// ASCII alphanumerics, `-` and `_` are kept, everything else becomes `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Storage key of an operation: the sanitized name followed by a digest of
/// the raw name, so distinct names never share artifacts.
pub fn storage_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let short: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("{}-{}", sanitize_name(name), short)
}
