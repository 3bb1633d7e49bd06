//! Bounded-concurrency batch fetcher.
//!
//! Epistemic foundation:
//! - K_i: At most `concurrency` fetches are in flight (semaphore)
//! - K_i: Every input key yields exactly one outcome, even if its task panics
//! - B_i: Each fetch may succeed or fail → Result inside the outcome
//! - I^B: Source availability unknowable → rate gate + retry per attempt

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::RecordCache;
use crate::client::{AsyncRateGate, RetryPolicy};
use crate::models::{BatchConfig, FetchError, Record};

/// Result of fetching one key.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub key: String,
    pub result: Result<Record, FetchError>,
    /// Calls made to the source (0 for a cache hit)
    pub attempts: u32,
    pub cached: bool,
    pub elapsed: Duration,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    fn task_failed(key: String, message: String) -> Self {
        Self {
            key,
            result: Err(FetchError::TaskFailed(message)),
            attempts: 0,
            cached: false,
            elapsed: Duration::ZERO,
        }
    }
}

/// Outcomes of one chunk.
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub outcomes: Vec<FetchOutcome>,
    /// Set when the chunk was cut short; keys without an outcome stay pending
    pub cancelled: bool,
}

/// Fetches keys with bounded concurrency, rate limiting and retry.
pub struct BoundedFetcher {
    gate: Arc<AsyncRateGate>,
    retry: RetryPolicy,
    batch: BatchConfig,
    semaphore: Arc<Semaphore>,
    cache: Option<Arc<dyn RecordCache>>,
}

impl BoundedFetcher {
    pub fn new(gate: Arc<AsyncRateGate>, retry: RetryPolicy, batch: BatchConfig) -> Self {
        let permits = batch.concurrency.max(1);
        Self {
            gate,
            retry,
            batch,
            semaphore: Arc::new(Semaphore::new(permits)),
            cache: None,
        }
    }

    /// Consult `cache` before fetching and store successful records in it.
    pub fn with_cache(mut self, cache: Arc<dyn RecordCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn batch(&self) -> &BatchConfig {
        &self.batch
    }

    pub fn gate(&self) -> &Arc<AsyncRateGate> {
        &self.gate
    }

    /// Fetch every key, chunk by chunk, pausing between chunks.
    pub async fn fetch_all<F, Fut>(&self, keys: Vec<String>, fetch: F) -> Vec<FetchOutcome>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Record, FetchError>> + Send + 'static,
    {
        let fetch = Arc::new(fetch);
        let never = CancellationToken::new();
        let chunk_size = self.batch.chunk_size.max(1);
        let total_chunks = keys.len().div_ceil(chunk_size);
        let mut outcomes = Vec::with_capacity(keys.len());

        for (index, chunk) in keys.chunks(chunk_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch.chunk_pause()).await;
            }
            debug!(chunk = index + 1, total_chunks = total_chunks, size = chunk.len(), "Fetching chunk");
            let result = self.fetch_chunk(chunk.to_vec(), &fetch, &never).await;
            outcomes.extend(result.outcomes);
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(total = outcomes.len(), failed = failed, "Fetch complete");
        outcomes
    }

    /// Fetch one chunk. Cancellation aborts in-flight tasks and returns the
    /// outcomes that had already finished.
    pub async fn fetch_chunk<F, Fut>(
        &self,
        keys: Vec<String>,
        fetch: &Arc<F>,
        cancel: &CancellationToken,
    ) -> ChunkOutcome
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Record, FetchError>> + Send + 'static,
    {
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            let task = FetchTask {
                gate: Arc::clone(&self.gate),
                retry: self.retry,
                semaphore: Arc::clone(&self.semaphore),
                cache: self.cache.clone(),
                fetch: Arc::clone(fetch),
            };
            let task_key = key.clone();
            handles.push((key, tokio::spawn(async move { task.run(task_key).await })));
        }

        let mut chunk = ChunkOutcome {
            outcomes: Vec::with_capacity(handles.len()),
            cancelled: false,
        };
        let mut handles = handles.into_iter();

        while let Some((key, mut handle)) = handles.next() {
            let joined = if chunk.cancelled {
                if !handle.is_finished() {
                    handle.abort();
                    continue;
                }
                handle.await
            } else {
                tokio::select! {
                    biased;
                    joined = &mut handle => joined,
                    _ = cancel.cancelled() => {
                        chunk.cancelled = true;
                        if !handle.is_finished() {
                            handle.abort();
                            continue;
                        }
                        handle.await
                    }
                }
            };

            match joined {
                Ok(outcome) => chunk.outcomes.push(outcome),
                Err(e) => {
                    warn!(key = %key, error = %e, "Fetch task panicked");
                    chunk
                        .outcomes
                        .push(FetchOutcome::task_failed(key, e.to_string()));
                }
            }
        }

        if chunk.cancelled {
            info!(finished = chunk.outcomes.len(), "Chunk cancelled");
        }
        chunk
    }
}

/// Everything one spawned fetch needs.
struct FetchTask<F> {
    gate: Arc<AsyncRateGate>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    cache: Option<Arc<dyn RecordCache>>,
    fetch: Arc<F>,
}

impl<F, Fut> FetchTask<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Record, FetchError>> + Send + 'static,
{
    async fn run(self, key: String) -> FetchOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return FetchOutcome::task_failed(key, "Semaphore closed".to_string()),
        };
        let start = Instant::now();

        if let Some(record) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            return FetchOutcome {
                key,
                result: Ok(record),
                attempts: 0,
                cached: true,
                elapsed: start.elapsed(),
            };
        }

        let retried = self
            .retry
            .run(|_attempt| {
                let gate = Arc::clone(&self.gate);
                let fetch = Arc::clone(&self.fetch);
                let key = key.clone();
                async move {
                    gate.acquire().await;
                    fetch(key).await
                }
            })
            .await;

        match &retried.result {
            Ok(record) => {
                debug!(key = %key, attempts = retried.attempts, "Fetched");
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.put(&key, record) {
                        warn!(key = %key, error = %e, "Failed to cache record");
                    }
                }
            }
            Err(e) => {
                error!(key = %key, attempts = retried.attempts, error = %e, "Fetch failed");
            }
        }

        FetchOutcome {
            key,
            result: retried.result,
            attempts: retried.attempts,
            cached: false,
            elapsed: start.elapsed(),
        }
    }
}
