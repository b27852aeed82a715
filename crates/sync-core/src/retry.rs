//! Exponential backoff retry discipline.
//!
//! All transient-failure handling in the engine goes through one policy so
//! the copier, applier, and capture workers degrade the same way under
//! pressure.

use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;

/// Exponential backoff schedule.
///
/// `max_attempts` counts the first try: a policy with `max_attempts = 5`
/// performs one initial attempt and up to four retries, sleeping
/// `delay(0) .. delay(3)` between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the `attempt`-th failed attempt (zero-based).
    /// Strictly increasing until it saturates at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }

    /// A fast schedule for tests: same shape, millisecond scale.
    pub fn fast() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Non-retryable errors are returned immediately; retryable ones are logged
/// and retried after the scheduled backoff. The final error is returned
/// as-is so callers can decide whether to record it and continue.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    "{what} failed ({err}), retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!("{what} failed after {} attempts: {err}", policy.max_attempts);
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_increase_strictly_until_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (0..4).map(|i| policy.delay(i)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0], "expected strictly increasing delays");
        }
        // Far past the cap the schedule saturates.
        assert_eq!(policy.delay(30), policy.max_delay);
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_the_bound() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::fast();

        let result: Result<(), SyncError> = retry_with_backoff(&policy, "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Transient("boom".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), policy.max_attempts);
    }

    #[tokio::test]
    async fn validation_errors_are_never_retried() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::fast();

        let result: Result<(), SyncError> = retry_with_backoff(&policy, "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Validation("bad".into())) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_failures_returns_value() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::fast();

        let result = retry_with_backoff(&policy, "op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
