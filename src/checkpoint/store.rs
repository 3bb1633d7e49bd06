//! Checkpoint store for resumable acquisition.
//!
//! Epistemic foundation:
//! - K_i: Each key moves pending → completed exactly once
//! - K_i: A snapshot writes partial results first, then the state document;
//!   the state document commits it
//! - B_i: Saved progress may not exist → `OperationNotFound`
//! - I^B: Corrupt state document → backup document provides recovery

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{Artifact, CheckpointBackend};
use super::state::{
    storage_name, KeyFailure, OperationState, OperationStatus, PartialResult, ProgressInfo,
    ProgressStats,
};
use crate::models::{HarvestError, Record, Result};

/// Default number of completions between automatic checkpoints.
pub const DEFAULT_CHECKPOINT_EVERY: usize = 100;

/// Durable progress of one named operation.
pub struct CheckpointStore {
    name: String,
    storage: String,
    backend: Arc<dyn CheckpointBackend>,
    checkpoint_every: usize,
    state: Option<OperationState>,
    key_set: HashSet<String>,
    completed_set: HashSet<String>,
    partials: Vec<PartialResult>,
    since_checkpoint: usize,
}

impl CheckpointStore {
    /// Create a store for `operation`. Artifacts are kept under
    /// [`storage_name`] of the operation.
    pub fn new(operation: &str, backend: Arc<dyn CheckpointBackend>) -> Self {
        Self::with_storage(operation.to_string(), storage_name(operation), backend)
    }

    /// Store over an existing storage key, as enumerated by a backend.
    fn from_storage(storage: &str, backend: Arc<dyn CheckpointBackend>) -> Self {
        Self::with_storage(storage.to_string(), storage.to_string(), backend)
    }

    fn with_storage(name: String, storage: String, backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            name,
            storage,
            backend,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            state: None,
            key_set: HashSet::new(),
            completed_set: HashSet::new(),
            partials: Vec::new(),
            since_checkpoint: 0,
        }
    }

    pub fn with_checkpoint_every(mut self, every: usize) -> Self {
        self.checkpoint_every = every.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key the backend stores this operation's artifacts under.
    pub fn storage_key(&self) -> &str {
        &self.storage
    }

    pub fn state(&self) -> Option<&OperationState> {
        self.state.as_ref()
    }

    pub fn status(&self) -> OperationStatus {
        self.state
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(OperationStatus::New)
    }

    fn state_mut(&mut self) -> Result<&mut OperationState> {
        let name = &self.name;
        self.state
            .as_mut()
            .ok_or_else(|| HarvestError::OperationNotStarted(name.clone()))
    }

    /// Begin a fresh operation over `keys` and write the first snapshot.
    ///
    /// Duplicate keys are dropped, first occurrence wins.
    pub fn start<I>(&mut self, keys: I, metadata: serde_json::Map<String, Value>) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        let keys: Vec<String> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();

        info!(operation = %self.name, total = keys.len(), "Starting operation");

        self.key_set = seen;
        self.completed_set.clear();
        self.partials.clear();
        self.since_checkpoint = 0;
        self.state = Some(OperationState::new(&self.name, keys, metadata));

        self.write_snapshot()
    }

    /// Move a key from pending to completed, keeping its result if given.
    ///
    /// Returns `false` for keys outside the operation or already completed.
    pub fn mark_completed(&mut self, key: &str, result: Option<Record>) -> Result<bool> {
        self.state_mut()?;
        if !self.transition(key) {
            return Ok(false);
        }
        if let Some(record) = result {
            self.partials.push(PartialResult {
                key: key.to_string(),
                record,
            });
        }
        Ok(true)
    }

    /// Complete a key with a terminal error.
    pub fn mark_failed(&mut self, key: &str, error: impl std::fmt::Display) -> Result<bool> {
        self.state_mut()?;
        if !self.transition(key) {
            return Ok(false);
        }
        let failure = KeyFailure {
            key: key.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        };
        self.state_mut()?.failures.push(failure);
        Ok(true)
    }

    /// Complete several keys at once. Returns how many transitioned.
    pub fn mark_batch_completed<I>(&mut self, results: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, Option<Record>)>,
    {
        let mut transitioned = 0;
        for (key, record) in results {
            if self.mark_completed(&key, record)? {
                transitioned += 1;
            }
        }
        Ok(transitioned)
    }

    fn transition(&mut self, key: &str) -> bool {
        if !self.key_set.contains(key) {
            debug!(operation = %self.name, key = %key, "Ignoring key outside operation");
            return false;
        }
        if !self.completed_set.insert(key.to_string()) {
            return false;
        }
        if let Some(state) = self.state.as_mut() {
            state.completed.push(key.to_string());
        }
        self.since_checkpoint += 1;
        true
    }

    /// Write a snapshot if forced or if enough completions accumulated.
    ///
    /// Returns whether a snapshot was written.
    pub fn checkpoint(&mut self, force: bool) -> Result<bool> {
        self.state_mut()?;
        if !force && self.since_checkpoint < self.checkpoint_every {
            return Ok(false);
        }
        self.write_snapshot()?;
        Ok(true)
    }

    fn write_snapshot(&mut self) -> Result<()> {
        let partial_bytes = serde_json::to_vec(&self.partials)
            .map_err(|e| HarvestError::Internal(format!("Serializing partial results: {e}")))?;
        let partial_count = self.partials.len();
        let since = self.since_checkpoint;

        let state = self.state_mut()?;
        if state.status == OperationStatus::Running && since > 0 {
            state.status = OperationStatus::Checkpointed;
        }
        state.partial_results_count = partial_count;
        state.last_checkpoint = Some(Utc::now());
        let state_bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| HarvestError::Internal(format!("Serializing checkpoint: {e}")))?;
        let completed = state.completed.len();
        let total = state.total();

        // Partial results first; the state document commits them
        self.backend.write(&self.storage, Artifact::Partial, &partial_bytes)?;
        self.backend.write(&self.storage, Artifact::State, &state_bytes)?;
        self.since_checkpoint = 0;

        info!(
            operation = %self.name,
            completed = completed,
            total = total,
            partial_results = partial_count,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Check whether a state document exists for this operation.
    pub fn has_saved_progress(&self) -> Result<bool> {
        Ok(self.backend.read(&self.storage, Artifact::State)?.is_some())
    }

    /// Read the state document, falling back to the backup if it is corrupt.
    fn read_state(&self) -> Result<Option<OperationState>> {
        let Some(bytes) = self.backend.read(&self.storage, Artifact::State)? else {
            return Ok(None);
        };
        match serde_json::from_slice::<OperationState>(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(primary_err) => {
                warn!(
                    operation = %self.name,
                    error = %primary_err,
                    "State document corrupt, trying backup"
                );
                let backup = self
                    .backend
                    .read(&self.storage, Artifact::StateBackup)?
                    .ok_or_else(|| {
                        HarvestError::ParseError(format!("Invalid checkpoint: {primary_err}"))
                    })?;
                serde_json::from_slice(&backup)
                    .map(Some)
                    .map_err(|e| HarvestError::ParseError(format!("Invalid checkpoint backup: {e}")))
            }
        }
    }

    /// Restore the saved operation.
    pub fn load(&mut self) -> Result<&OperationState> {
        let mut state = self
            .read_state()?
            .ok_or_else(|| HarvestError::OperationNotFound(self.name.clone()))?;

        let mut partials: Vec<PartialResult> = match self.backend.read(&self.storage, Artifact::Partial)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| HarvestError::ParseError(format!("Invalid partial results: {e}")))?,
            None => Vec::new(),
        };
        if partials.len() > state.partial_results_count {
            debug!(
                operation = %self.name,
                discarded = partials.len() - state.partial_results_count,
                "Discarding uncommitted partial results"
            );
            partials.truncate(state.partial_results_count);
        } else if partials.len() < state.partial_results_count {
            warn!(
                operation = %self.name,
                expected = state.partial_results_count,
                found = partials.len(),
                "Fewer partial results than committed"
            );
        }

        self.key_set = state.keys.iter().cloned().collect();
        self.completed_set = state
            .completed
            .iter()
            .filter(|k| self.key_set.contains(*k))
            .cloned()
            .collect();
        state.completed.retain(|k| self.key_set.contains(k));

        info!(
            operation = %self.name,
            previous_status = %state.status,
            completed = state.completed.len(),
            remaining = state.remaining(),
            "Resuming from checkpoint"
        );

        if state.status != OperationStatus::Completed {
            state.status = OperationStatus::Running;
        }
        self.partials = partials;
        self.since_checkpoint = 0;
        Ok(&*self.state.insert(state))
    }

    /// Keys still to be processed, in start order.
    pub fn remaining_keys(&self) -> Vec<String> {
        match &self.state {
            Some(state) => state
                .keys
                .iter()
                .filter(|k| !self.completed_set.contains(*k))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn partial_results(&self) -> &[PartialResult] {
        &self.partials
    }

    /// Consume the accumulated partial results.
    pub fn take_partial_results(&mut self) -> Vec<PartialResult> {
        std::mem::take(&mut self.partials)
    }

    /// Record cancellation and force a snapshot.
    pub fn mark_interrupted(&mut self) -> Result<()> {
        self.state_mut()?.status = OperationStatus::Interrupted;
        warn!(operation = %self.name, "Operation interrupted, saving progress");
        self.write_snapshot()
    }

    /// Record that every key completed and force a snapshot.
    pub fn mark_finished(&mut self) -> Result<()> {
        let state = self.state_mut()?;
        if !state.is_complete() {
            return Err(HarvestError::InvalidInput(format!(
                "operation '{}' still has {} pending keys",
                state.operation,
                state.remaining()
            )));
        }
        state.status = OperationStatus::Completed;
        self.write_snapshot()
    }

    /// Delete all durable state of this operation.
    pub fn clear(&mut self) -> Result<()> {
        self.backend.remove(&self.storage)?;
        self.state = None;
        self.key_set.clear();
        self.completed_set.clear();
        self.partials.clear();
        self.since_checkpoint = 0;
        info!(operation = %self.name, "Cleared saved progress");
        Ok(())
    }

    /// Saved progress summary, without loading partial results.
    pub fn progress_info(&self) -> Result<Option<ProgressInfo>> {
        Ok(self.read_state()?.map(|s| s.info()))
    }

    /// Counters of the in-memory operation.
    pub fn stats(&self) -> ProgressStats {
        match &self.state {
            Some(state) => ProgressStats {
                total: state.total(),
                completed: state.completed.len(),
                succeeded: state.completed.len().saturating_sub(state.failures.len()),
                failed: state.failures.len(),
                remaining: state.remaining(),
                completion_percent: state.completion_percent(),
                since_checkpoint: self.since_checkpoint,
            },
            None => ProgressStats::default(),
        }
    }
}

/// Summaries of every saved operation in a backend.
pub fn list_saved_progress(backend: &Arc<dyn CheckpointBackend>) -> Result<Vec<ProgressInfo>> {
    let mut infos = Vec::new();
    for name in backend.operations()? {
        let store = CheckpointStore::from_storage(&name, Arc::clone(backend));
        match store.progress_info() {
            Ok(Some(info)) => infos.push(info),
            Ok(None) => {}
            Err(e) => warn!(operation = %name, error = %e, "Skipping unreadable progress"),
        }
    }
    Ok(infos)
}

/// Delete every saved operation in a backend. Returns how many were removed.
pub fn clear_all_progress(backend: &Arc<dyn CheckpointBackend>) -> Result<usize> {
    let names = backend.operations()?;
    for name in &names {
        backend.remove(name)?;
    }
    info!(count = names.len(), "Cleared all saved progress");
    Ok(names.len())
}
