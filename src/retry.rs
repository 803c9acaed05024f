//! Bounded retries with exponential backoff and jitter.
//!
//! Two callers exist today: API discovery in the cluster client (retry any
//! failure a few times) and finalizer removal (retry only optimistic
//! concurrency conflicts, re-reading the instance between attempts).
//!
//! ```ignore
//! use meshop::retry::{retry_when, RetryConfig};
//!
//! let removed = retry_when(
//!     &RetryConfig::finalizer_conflicts(),
//!     "remove_finalizer",
//!     Error::is_conflict,
//!     || async { instances.replace(&latest).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Conflict retries allowed after the first finalizer write.
pub const FINALIZER_CONFLICT_RETRIES: u32 = 5;

/// Backoff settings for an operation that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied after each retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config bounded to `attempts` total attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// One write plus [`FINALIZER_CONFLICT_RETRIES`] conflict retries.
    pub fn finalizer_conflicts() -> Self {
        Self {
            max_attempts: FINALIZER_CONFLICT_RETRIES + 1,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }

    /// Same attempt budget with no sleeping between attempts.
    pub fn without_delay(mut self) -> Self {
        self.initial_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self
    }
}

/// Retry `operation` only while `should_retry` accepts the error.
///
/// Errors rejected by the predicate are returned immediately. When the
/// attempt budget is exhausted the last error is returned.
pub async fn retry_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&err) {
            debug!(operation = %operation_name, attempt, error = %err, "Error is not retryable");
            return Err(err);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            warn!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        // 0.5x to 1.5x of the current delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        debug!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered_delay.as_millis(),
            "Operation failed, retrying"
        );

        if !jittered_delay.is_zero() {
            tokio::time::sleep(jittered_delay).await;
        }

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig::with_max_attempts(attempts).without_delay()
    }

    #[tokio::test]
    async fn first_success_returns_without_retrying() {
        let result: Result<i32, &str> = retry_when(&fast(3), "op", |_| true, || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_when(&fast(5), "op", |_| true, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky")
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_when(&fast(3), "op", |_| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("down")
            }
        })
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_when(
            &fast(6),
            "op",
            |e: &&str| *e == "conflict",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden")
                }
            },
        )
        .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalizer_budget_is_one_write_plus_five_retries() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig::finalizer_conflicts().without_delay();
        let result: Result<(), &str> = retry_when(
            &config,
            "remove_finalizer",
            |e: &&str| *e == "conflict",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("conflict")
                }
            },
        )
        .await;

        assert_eq!(result, Err("conflict"));
        assert_eq!(count.load(Ordering::SeqCst), 1 + FINALIZER_CONFLICT_RETRIES);
    }
}
