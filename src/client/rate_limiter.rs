//! Sliding-window rate gate for outbound calls.
//!
//! Epistemic foundation:
//! - K_i: A source allows at most `max_calls` within any trailing `window`
//! - K_i: Consecutive calls must be at least `min_spacing` apart
//! - B_i: Sleeping for the computed wait is enough (re-checked after every sleep)
//! - I^B: Other callers may take the slot while we sleep, so the check and the
//!   record happen under one lock

use std::collections::VecDeque;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::models::RateLimitConfig;

/// Limits enforced by a rate gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum calls within the trailing window
    pub max_calls: usize,
    /// Window length
    pub window: Duration,
    /// Minimum spacing between consecutive calls
    pub min_spacing: Duration,
}

impl RateLimit {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            min_spacing: Duration::ZERO,
        }
    }

    pub fn with_min_spacing(mut self, min_spacing: Duration) -> Self {
        self.min_spacing = min_spacing;
        self
    }
}

impl From<&RateLimitConfig> for RateLimit {
    fn from(config: &RateLimitConfig) -> Self {
        RateLimit::new(config.max_calls, Duration::from_secs(config.window_secs))
            .with_min_spacing(Duration::from_millis(config.min_spacing_ms))
    }
}

/// Snapshot of a gate's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateStats {
    pub calls_in_window: usize,
    pub calls_remaining: usize,
    pub max_calls: usize,
    pub window: Duration,
    /// Time until the oldest in-window call expires (zero for an empty window)
    pub reset_in: Duration,
    pub total_calls: u64,
    pub total_wait: Duration,
}

/// Timestamps of recorded calls, shared by the blocking and async gates.
///
/// Generic over the clock so the async gate can run on tokio's pausable time.
#[derive(Debug)]
struct CallWindow<I> {
    limit: RateLimit,
    calls: VecDeque<I>,
    last_call: Option<I>,
}

impl<I> CallWindow<I>
where
    I: Copy + Ord + Add<Duration, Output = I> + Sub<I, Output = Duration>,
{
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            calls: VecDeque::with_capacity(limit.max_calls),
            last_call: None,
        }
    }

    /// Drop timestamps that left the window. A call is in-window while
    /// `now < timestamp + window`.
    fn prune(&mut self, now: I) {
        while let Some(&oldest) = self.calls.front() {
            if now >= oldest + self.limit.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time to wait before another call may be made at `now`.
    fn wait_time(&mut self, now: I) -> Duration {
        self.prune(now);
        let mut wait = Duration::ZERO;

        if self.calls.len() >= self.limit.max_calls {
            if let Some(&oldest) = self.calls.front() {
                wait = wait.max((oldest + self.limit.window) - now);
            }
        }

        if let Some(last) = self.last_call {
            let next_allowed = last + self.limit.min_spacing;
            if now < next_allowed {
                wait = wait.max(next_allowed - now);
            }
        }

        wait
    }

    fn record(&mut self, now: I) {
        self.prune(now);
        self.calls.push_back(now);
        self.last_call = Some(now);
    }

    fn stats(&mut self, now: I, counters: &Counters) -> GateStats {
        self.prune(now);
        let reset_in = self
            .calls
            .front()
            .map(|&oldest| (oldest + self.limit.window) - now)
            .unwrap_or(Duration::ZERO);

        GateStats {
            calls_in_window: self.calls.len(),
            calls_remaining: self.limit.max_calls.saturating_sub(self.calls.len()),
            max_calls: self.limit.max_calls,
            window: self.limit.window,
            reset_in,
            total_calls: counters.total_calls.load(Ordering::Relaxed),
            total_wait: Duration::from_millis(counters.total_wait_ms.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_calls: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Counters {
    fn add_wait(&self, wait: Duration) {
        self.total_wait_ms
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Blocking gate
// ═══════════════════════════════════════════════════════════════════════════

/// Rate gate for synchronous callers. Waiting blocks the current thread.
#[derive(Debug)]
pub struct RateGate {
    window: Mutex<CallWindow<Instant>>,
    counters: Counters,
}

impl RateGate {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            window: Mutex::new(CallWindow::new(limit)),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallWindow<Instant>> {
        // A panic while holding the lock cannot leave the window inconsistent
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until a call is allowed and return a permit holding the window.
    pub fn permit(&self) -> Permit<'_> {
        loop {
            let mut guard = self.lock();
            let wait = guard.wait_time(Instant::now());
            if wait.is_zero() {
                return Permit {
                    guard,
                    counters: &self.counters,
                    recorded: false,
                };
            }
            drop(guard);

            debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate gate");
            self.counters.add_wait(wait);
            std::thread::sleep(wait);
        }
    }

    /// Wait for a permit and record the call immediately.
    pub fn acquire(&self) {
        self.permit().record();
    }

    pub fn stats(&self) -> GateStats {
        self.lock().stats(Instant::now(), &self.counters)
    }
}

/// Permission to make one call. Holds the window lock until recorded.
pub struct Permit<'a> {
    guard: MutexGuard<'a, CallWindow<Instant>>,
    counters: &'a Counters,
    recorded: bool,
}

impl Permit<'_> {
    /// Record the call and release the window.
    pub fn record(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        self.guard.record(Instant::now());
        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);
        self.recorded = true;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            warn!("Rate gate permit dropped without record; recording the call");
            self.commit();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Async gate
// ═══════════════════════════════════════════════════════════════════════════

/// Rate gate for async callers. Waiting yields to the runtime.
#[derive(Debug)]
pub struct AsyncRateGate {
    window: tokio::sync::Mutex<CallWindow<tokio::time::Instant>>,
    counters: Counters,
}

impl AsyncRateGate {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            window: tokio::sync::Mutex::new(CallWindow::new(limit)),
            counters: Counters::default(),
        }
    }

    /// Wait until a call is allowed and return a permit holding the window.
    pub async fn permit(&self) -> AsyncPermit<'_> {
        loop {
            let mut guard = self.window.lock().await;
            let wait = guard.wait_time(tokio::time::Instant::now());
            if wait.is_zero() {
                return AsyncPermit {
                    guard,
                    counters: &self.counters,
                    recorded: false,
                };
            }
            drop(guard);

            debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate gate");
            self.counters.add_wait(wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait for a permit and record the call immediately.
    pub async fn acquire(&self) {
        self.permit().await.record();
    }

    pub async fn stats(&self) -> GateStats {
        self.window
            .lock()
            .await
            .stats(tokio::time::Instant::now(), &self.counters)
    }
}

/// Async counterpart of [`Permit`].
pub struct AsyncPermit<'a> {
    guard: tokio::sync::MutexGuard<'a, CallWindow<tokio::time::Instant>>,
    counters: &'a Counters,
    recorded: bool,
}

impl AsyncPermit<'_> {
    pub fn record(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        self.guard.record(tokio::time::Instant::now());
        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);
        self.recorded = true;
    }
}

impl Drop for AsyncPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            warn!("Rate gate permit dropped without record; recording the call");
            self.commit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_window_respected<I>(times: &mut [I], limit: RateLimit)
    where
        I: Copy + Ord + Sub<I, Output = Duration>,
    {
        times.sort();
        for i in limit.max_calls..times.len() {
            let span = times[i] - times[i - limit.max_calls];
            assert!(
                span >= limit.window,
                "calls {} and {} only {:?} apart",
                i - limit.max_calls,
                i,
                span
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_calls_in_window() {
        let limit = RateLimit::new(3, Duration::from_secs(10));
        let gate = AsyncRateGate::new(limit);
        let mut times = Vec::new();

        for _ in 0..10 {
            gate.acquire().await;
            times.push(tokio::time::Instant::now());
        }

        assert_window_respected(&mut times, limit);
        assert_eq!(gate.stats().await.total_calls, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_window() {
        let limit = RateLimit::new(4, Duration::from_secs(5));
        let gate = Arc::new(AsyncRateGate::new(limit));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                gate.acquire().await;
                tokio::time::Instant::now()
            }));
        }

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        assert_window_respected(&mut times, limit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_recomputed_from_oldest_at_boundary() {
        let gate = AsyncRateGate::new(RateLimit::new(2, Duration::from_secs(1)));
        let start = tokio::time::Instant::now();

        gate.acquire().await;
        gate.acquire().await;
        gate.acquire().await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_spacing_between_calls() {
        let gate = AsyncRateGate::new(
            RateLimit::new(100, Duration::from_secs(60)).with_min_spacing(Duration::from_millis(250)),
        );
        let start = tokio::time::Instant::now();
        for _ in 0..5 {
            gate.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_still_records() {
        let gate = AsyncRateGate::new(RateLimit::new(5, Duration::from_secs(60)));
        {
            let _permit = gate.permit().await;
        }
        let stats = gate.stats().await;
        assert_eq!(stats.calls_in_window, 1);
        assert_eq!(stats.calls_remaining, 4);
    }

    #[test]
    fn test_blocking_gate_shared_across_threads() {
        let limit = RateLimit::new(3, Duration::from_millis(200));
        let gate = Arc::new(RateGate::new(limit));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    (0..2)
                        .map(|_| {
                            // Taken while the permit holds the window
                            let permit = gate.permit();
                            let at = Instant::now();
                            permit.record();
                            at
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut times: Vec<Instant> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(times.len(), 16);
        assert_window_respected(&mut times, limit);
        assert_eq!(gate.stats().total_calls, 16);
    }

    #[test]
    fn test_empty_window_stats() {
        let gate = RateGate::new(RateLimit::new(10, Duration::from_secs(3600)));
        let stats = gate.stats();
        assert_eq!(stats.calls_in_window, 0);
        assert_eq!(stats.calls_remaining, 10);
        assert_eq!(stats.reset_in, Duration::ZERO);
    }

    #[test]
    fn test_blocking_gate_spacing() {
        let gate = RateGate::new(
            RateLimit::new(10, Duration::from_secs(1)).with_min_spacing(Duration::from_millis(20)),
        );
        let start = Instant::now();
        gate.acquire();
        gate.acquire();
        gate.acquire();
        assert!(start.elapsed() >= Duration::from_millis(40));

        let stats = gate.stats();
        assert_eq!(stats.calls_in_window, 3);
        assert!(stats.reset_in > Duration::ZERO);
        assert!(stats.reset_in <= Duration::from_secs(1));
    }

    #[test]
    fn test_call_window_expiry_is_exclusive() {
        let limit = RateLimit::new(1, Duration::from_secs(1));
        let mut window = CallWindow::new(limit);
        let t0 = Instant::now();
        window.record(t0);
        assert_eq!(window.wait_time(t0 + Duration::from_millis(400)), Duration::from_millis(600));
        assert_eq!(window.wait_time(t0 + Duration::from_secs(1)), Duration::ZERO);
    }
}
