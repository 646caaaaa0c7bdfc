//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use novelkb_shared::RetryConfig;

use crate::BackendError;

/// An error that knows whether it is worth retrying.
pub trait Retryable: Display {
    fn is_retryable(&self) -> bool;

    /// Minimum wait the failing side asked for.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        BackendError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        BackendError::retry_after(self)
    }
}

/// Final result of a retried operation plus the number of attempts made.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_backoff_ms,
            config.max_backoff_ms,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries as u32 + 1
    }

    /// Wait before retry number `retry` (1-based): `initial * 2^(retry-1)`,
    /// capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. A server-requested delay longer than the
    /// computed backoff is honoured up to `max_backoff`.
    pub async fn run<F, Fut, T, E>(&self, operation: &str, mut f: F) -> Attempted<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match f(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempts = attempt, "succeeded after retries");
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.max_attempts() {
                        warn!(operation, attempts = attempt, error = %e, "giving up");
                        return Attempted {
                            result: Err(e),
                            attempts: attempt,
                        };
                    }

                    let mut wait = self.backoff(attempt);
                    if let Some(requested) = e.retry_after() {
                        wait = wait.max(requested.min(self.max_backoff));
                    }

                    warn!(
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(5, 800, 3000);
        assert_eq!(policy.backoff(1), Duration::from_millis(800));
        assert_eq!(policy.backoff(2), Duration::from_millis(1600));
        assert_eq!(policy.backoff(3), Duration::from_millis(3000));
        assert_eq!(policy.backoff(30), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 0, 0);

        let out = policy
            .run("test", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BackendError::Network("reset".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(out.result, Ok("done"));
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn stops_after_budget() {
        let policy = RetryPolicy::new(2, 0, 0);
        let out: Attempted<(), _> = policy
            .run("test", |_| async { Err(BackendError::EmptyResponse) })
            .await;
        assert_eq!(out.result, Err(BackendError::EmptyResponse));
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let policy = RetryPolicy::new(5, 0, 0);
        let out: Attempted<(), _> = policy
            .run("test", |_| async {
                Err(BackendError::Api {
                    status: 400,
                    message: "bad request".into(),
                })
            })
            .await;
        assert_eq!(out.attempts, 1);
    }
}
