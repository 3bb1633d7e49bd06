//! Resumable acquisition pipeline.
//!
//! Flow: Load or start operation → Fetch remaining keys chunk by chunk →
//! Mark completions → Checkpoint on cadence → Finish or flush on cancel

use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointStore, OperationStatus, PartialResult};
use crate::models::{FetchError, Record, Result};
use crate::pool::BoundedFetcher;

/// A key that failed permanently in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedKey {
    pub key: String,
    pub error: FetchError,
}

/// Summary of one acquisition run.
#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    pub operation: String,
    /// Whether saved progress was loaded
    pub resumed: bool,
    pub total: usize,
    /// Keys completed by earlier runs
    pub previously_completed: usize,
    /// Keys fetched successfully in this run
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedKey>,
    /// Keys that needed more than one attempt
    pub retried: usize,
    /// Keys served from the record cache
    pub cached: usize,
    /// Keys still pending (non-zero only when cancelled)
    pub remaining: usize,
    pub cancelled: bool,
    /// Every result accumulated by the operation, earlier runs included
    pub records: Vec<PartialResult>,
    pub elapsed: Duration,
}

impl AcquisitionReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.remaining == 0
    }
}

/// Drives a fetcher over the keys of a checkpointed operation.
pub struct Acquisition {
    fetcher: BoundedFetcher,
    store: CheckpointStore,
    metadata: serde_json::Map<String, Value>,
    clear_on_complete: bool,
    show_progress: bool,
}

impl Acquisition {
    pub fn new(fetcher: BoundedFetcher, store: CheckpointStore) -> Self {
        Self {
            fetcher,
            store,
            metadata: serde_json::Map::new(),
            clear_on_complete: true,
            show_progress: false,
        }
    }

    /// Metadata stored with a newly started operation.
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Delete saved progress once every key completed.
    pub fn with_clear_on_complete(mut self, clear: bool) -> Self {
        self.clear_on_complete = clear;
        self
    }

    /// Draw a progress bar on stderr.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
        )
        .map(|s| s.progress_chars("##-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }

    /// Run the operation over `keys`, resuming saved progress unless `fresh`.
    ///
    /// Cancelling `cancel` stops between chunks or mid-chunk; the checkpoint
    /// is flushed before this returns. Checkpoint I/O failures are returned
    /// as errors, per-key failures are reported in the report.
    pub async fn run<F, Fut>(
        &mut self,
        keys: Vec<String>,
        fetch: F,
        cancel: CancellationToken,
        fresh: bool,
    ) -> Result<AcquisitionReport>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Record, FetchError>> + Send + 'static,
    {
        let start = Instant::now();
        let fetch = Arc::new(fetch);

        let resumed = if fresh || !self.store.has_saved_progress()? {
            if fresh && self.store.has_saved_progress()? {
                info!(operation = %self.store.name(), "Discarding saved progress");
                self.store.clear()?;
            }
            self.store.start(keys, self.metadata.clone())?;
            false
        } else {
            let state = self.store.load()?;
            let known: HashSet<&str> = state.keys.iter().map(String::as_str).collect();
            let unknown = keys.iter().filter(|k| !known.contains(k.as_str())).count();
            if unknown > 0 {
                warn!(
                    operation = %state.operation,
                    unknown = unknown,
                    "Keys not part of the saved operation are ignored; run with fresh to restart"
                );
            }
            true
        };

        let remaining = self.store.remaining_keys();
        let total = self.store.stats().total;
        let previously_completed = total - remaining.len();

        info!(
            operation = %self.store.name(),
            total = total,
            pending = remaining.len(),
            already_done = previously_completed,
            "Acquisition starting"
        );

        let pb = self.progress_bar(total);
        pb.set_position(previously_completed as u64);

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut retried = 0;
        let mut cached = 0;
        let mut cancelled = false;

        let chunk_size = self.fetcher.batch().chunk_size.max(1);
        let pause = self.fetcher.batch().chunk_pause();

        for (index, chunk) in remaining.chunks(chunk_size).enumerate() {
            if index > 0 && !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let outcome = self.fetcher.fetch_chunk(chunk.to_vec(), &fetch, &cancel).await;

            for result in outcome.outcomes {
                if result.attempts > 1 {
                    retried += 1;
                }
                if result.cached {
                    cached += 1;
                }
                match result.result {
                    Ok(record) => {
                        if self.store.mark_completed(&result.key, Some(record))? {
                            succeeded.push(result.key);
                        }
                    }
                    Err(error) => {
                        if self.store.mark_failed(&result.key, &error)? {
                            failed.push(FailedKey {
                                key: result.key,
                                error,
                            });
                        }
                    }
                }
                self.store.checkpoint(false)?;
                pb.inc(1);
            }
            pb.set_message(format!("ok: {}, failed: {}", succeeded.len(), failed.len()));

            if outcome.cancelled {
                cancelled = true;
                break;
            }
        }

        let remaining = self.store.remaining_keys().len();
        if cancelled {
            self.store.mark_interrupted()?;
            pb.abandon_with_message(format!("Interrupted, {remaining} keys pending"));
        } else if self.store.status() != OperationStatus::Completed {
            self.store.mark_finished()?;
            pb.finish_with_message(format!(
                "Done! {} ok, {} failed",
                succeeded.len(),
                failed.len()
            ));
        }

        let records = self.store.partial_results().to_vec();
        let operation = self.store.name().to_string();
        if !cancelled && self.clear_on_complete {
            self.store.clear()?;
        }

        let report = AcquisitionReport {
            operation,
            resumed,
            total,
            previously_completed,
            succeeded,
            failed,
            retried,
            cached,
            remaining,
            cancelled,
            records,
            elapsed: start.elapsed(),
        };

        info!(
            operation = %report.operation,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            retried = report.retried,
            remaining = report.remaining,
            cancelled = report.cancelled,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Acquisition finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Artifact, CheckpointBackend, MemoryBackend};
    use crate::client::{AsyncRateGate, RateLimit, RetryPolicy};
    use crate::models::{record_from, BatchConfig, HarvestError};
    use dashmap::DashMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Memory backend that counts state writes and can fail them.
    #[derive(Default)]
    struct CountingBackend {
        inner: MemoryBackend,
        state_writes: AtomicUsize,
        /// State writes allowed before every further one fails
        fail_after: Option<usize>,
    }

    impl CheckpointBackend for CountingBackend {
        fn read(&self, name: &str, artifact: Artifact) -> Result<Option<Vec<u8>>> {
            self.inner.read(name, artifact)
        }

        fn write(&self, name: &str, artifact: Artifact, bytes: &[u8]) -> Result<()> {
            if artifact == Artifact::State {
                let n = self.state_writes.fetch_add(1, Ordering::SeqCst) + 1;
                if self.fail_after.is_some_and(|limit| n > limit) {
                    return Err(HarvestError::io(
                        format!("writing checkpoint for {name}"),
                        std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                    ));
                }
            }
            self.inner.write(name, artifact, bytes)
        }

        fn remove(&self, name: &str) -> Result<()> {
            self.inner.remove(name)
        }

        fn operations(&self) -> Result<Vec<String>> {
            self.inner.operations()
        }
    }

    fn fetcher(concurrency: usize, chunk_size: usize) -> BoundedFetcher {
        BoundedFetcher::new(
            Arc::new(AsyncRateGate::new(RateLimit::new(1000, Duration::from_secs(1)))),
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100)),
            BatchConfig {
                concurrency,
                chunk_size,
                chunk_pause_ms: 0,
            },
        )
    }

    fn acquisition(backend: &Arc<dyn CheckpointBackend>, name: &str) -> Acquisition {
        let store = CheckpointStore::new(name, Arc::clone(backend)).with_checkpoint_every(2);
        Acquisition::new(fetcher(2, 4), store)
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_reports_and_clears() {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(MemoryBackend::new());
        let mut run = acquisition(&backend, "full");

        let fetch = |key: String| async move {
            if key.ends_with('3') {
                Err(FetchError::NotFound(key))
            } else {
                Ok(record_from([("id", json!(key))]))
            }
        };

        let report = run
            .run(keys(15), fetch, CancellationToken::new(), false)
            .await
            .unwrap();

        assert!(report.is_complete());
        assert!(!report.resumed);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.succeeded.len(), 13);
        assert_eq!(report.records.len(), 13);
        assert!(!run.store().has_saved_progress().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(MemoryBackend::new());
        let mut run = acquisition(&backend, "retry");
        let calls: Arc<DashMap<String, u32>> = Arc::new(DashMap::new());

        let counter = Arc::clone(&calls);
        let fetch = move |key: String| {
            let n = {
                let mut entry = counter.entry(key.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            async move {
                if key == "2" && n <= 2 {
                    Err(FetchError::Connection("reset".into()))
                } else {
                    Ok(record_from([("id", json!(key))]))
                }
            }
        };

        let report = run
            .run(
                vec!["1".into(), "2".into(), "3".into()],
                fetch,
                CancellationToken::new(),
                false,
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 3);
        assert_eq!(report.retried, 1);
        assert_eq!(*calls.get("2").unwrap(), 3);
        assert_eq!(*calls.get("1").unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_resume_covers_every_key_once() {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(MemoryBackend::new());
        let slow = |key: String| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(record_from([("id", json!(key))]))
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5500)).await;
            trigger.cancel();
        });

        let mut first = acquisition(&backend, "resume");
        let report = first.run(keys(20), slow, cancel, false).await.unwrap();
        assert!(report.cancelled);
        assert!(report.remaining > 0);
        assert!(!report.succeeded.is_empty());

        let info = first.store().progress_info().unwrap().unwrap();
        assert_eq!(info.status, OperationStatus::Interrupted);
        assert_eq!(info.completed, report.succeeded.len());

        let mut second = acquisition(&backend, "resume");
        let resumed = second
            .run(keys(20), slow, CancellationToken::new(), false)
            .await
            .unwrap();

        assert!(resumed.resumed);
        assert!(resumed.is_complete());
        assert_eq!(resumed.previously_completed, report.succeeded.len());
        assert_eq!(resumed.records.len(), 20);
        let distinct: HashSet<_> = resumed.records.iter().map(|r| r.key.clone()).collect();
        assert_eq!(distinct, keys(20).into_iter().collect::<HashSet<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_discards_saved_progress() {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(MemoryBackend::new());
        let fetch = |key: String| async move { Ok(record_from([("id", json!(key))])) };

        let mut keep = acquisition(&backend, "fresh").with_clear_on_complete(false);
        let first = keep
            .run(keys(3), fetch, CancellationToken::new(), false)
            .await
            .unwrap();
        assert_eq!(first.succeeded.len(), 3);

        let mut again = acquisition(&backend, "fresh").with_clear_on_complete(false);
        let nothing = again
            .run(keys(3), fetch, CancellationToken::new(), false)
            .await
            .unwrap();
        assert!(nothing.resumed);
        assert!(nothing.succeeded.is_empty());
        assert_eq!(nothing.records.len(), 3);

        let mut restart = acquisition(&backend, "fresh");
        let redone = restart
            .run(keys(3), fetch, CancellationToken::new(), true)
            .await
            .unwrap();
        assert!(!redone.resumed);
        assert_eq!(redone.succeeded.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_write_failure_is_returned() {
        let backend = Arc::new(CountingBackend {
            fail_after: Some(3),
            ..Default::default()
        });
        let shared: Arc<dyn CheckpointBackend> = backend.clone();
        let mut run = acquisition(&shared, "disk-full");
        let fetch = |key: String| async move { Ok(record_from([("id", json!(key))])) };

        let result = run.run(keys(10), fetch, CancellationToken::new(), false).await;

        assert!(matches!(result, Err(HarvestError::Io { .. })));
        assert_eq!(backend.state_writes.load(Ordering::SeqCst), 4);
        let info = run.store().progress_info().unwrap().unwrap();
        assert_ne!(info.status, OperationStatus::Completed);
        assert_eq!(info.completed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoints_follow_cadence_not_chunks() {
        let backend = Arc::new(CountingBackend::default());
        let shared: Arc<dyn CheckpointBackend> = backend.clone();
        let store = CheckpointStore::new("cadence", shared).with_checkpoint_every(100);
        let mut run = Acquisition::new(fetcher(2, 2), store).with_clear_on_complete(false);
        let fetch = |key: String| async move { Ok(record_from([("id", json!(key))])) };

        let report = run
            .run(keys(6), fetch, CancellationToken::new(), false)
            .await
            .unwrap();

        assert!(report.is_complete());
        // One write on start, one on finish
        assert_eq!(backend.state_writes.load(Ordering::SeqCst), 2);
    }
}
