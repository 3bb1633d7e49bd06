//! Exponential backoff for transient faults.
//!
//! Epistemic foundation:
//! - K_i: delay(attempt) = min(base * 2^attempt, cap), no jitter
//! - B_i: A transient fault (connection, timeout, 429, 5xx) may clear on retry
//! - I^B: A permanent fault (not found, validation, auth) never clears, so it is
//!   returned on the first occurrence

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{FetchError, HarvestError, RetryConfig};

/// Classification of an error for retry purposes.
pub trait Retryable {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;

    /// Delay requested by the source, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn retry_after(&self) -> Option<Duration> {
        FetchError::retry_after(self)
    }
}

impl Retryable for HarvestError {
    fn is_retryable(&self) -> bool {
        HarvestError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            HarvestError::Fetch(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Final result of a retried operation plus the number of attempts made.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> Retried<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Retry policy with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Backoff before retry number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wait before the next attempt, honouring the source's hint up to the cap.
    fn wait_for<E: Retryable>(&self, attempt: u32, error: &E) -> Duration {
        let backoff = self.delay(attempt);
        match error.retry_after() {
            Some(hint) => backoff.max(hint.min(self.max_delay)),
            None => backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// `op` receives the zero-based attempt number.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Retried<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Retried {
                        result: Ok(value),
                        attempts: attempt + 1,
                    }
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let wait = self.wait_for(attempt, &e);
                    warn!(
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(attempts = attempt + 1, error = %e, "Giving up");
                    return Retried {
                        result: Err(e),
                        attempts: attempt + 1,
                    };
                }
            }
        }
    }

    /// Blocking counterpart of [`RetryPolicy::run`]; sleeps the current thread.
    pub fn run_blocking<F, T, E>(&self, mut op: F) -> Retried<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => {
                    return Retried {
                        result: Ok(value),
                        attempts: attempt + 1,
                    }
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let wait = self.wait_for(attempt, &e);
                    warn!(
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => {
                    return Retried {
                        result: Err(e),
                        attempts: attempt + 1,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn test_delay_is_monotonic_and_capped() {
        let p = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(10));
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let d = p.delay(attempt);
            assert!(d >= previous);
            assert!(d <= p.max_delay);
            previous = d;
        }
        assert_eq!(p.delay(0), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_secs(2));
        assert_eq!(p.delay(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_two_transient_failures() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let retried = policy()
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FetchError::Connection("reset".into()))
                    } else {
                        Ok("record")
                    }
                }
            })
            .await;

        assert_eq!(retried.result, Ok("record"));
        assert_eq!(retried.attempts, 3);
        // 1s + 2s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let retried: Retried<(), _> = policy()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::NotFound("42".into())) }
            })
            .await;

        assert_eq!(retried.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(retried.result, Err(FetchError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let retried: Retried<(), _> = policy()
            .run(|attempt| async move {
                Err(FetchError::Server {
                    status: 503,
                    message: format!("attempt {attempt}"),
                })
            })
            .await;

        assert_eq!(retried.attempts, 4);
        assert_eq!(
            retried.result,
            Err(FetchError::Server {
                status: 503,
                message: "attempt 3".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_wait() {
        let start = tokio::time::Instant::now();
        let retried = policy()
            .run(|attempt| async move {
                if attempt == 0 {
                    Err(FetchError::RateLimited {
                        retry_after: Some(Duration::from_secs(5)),
                    })
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(retried.result, Ok(1));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_blocking_variant() {
        let p = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
        let retried = p.run_blocking(|attempt| {
            if attempt < 2 {
                Err(FetchError::Timeout(Duration::from_secs(1)))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(retried.result, Ok(2));
        assert_eq!(retried.attempts, 3);

        let none = RetryPolicy::none().run_blocking(|_| -> Result<(), _> {
            Err(FetchError::Connection("down".into()))
        });
        assert_eq!(none.attempts, 1);
    }
}
