use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use trellis_common::CoordError;

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for CoordError {
    fn is_retryable(&self) -> bool {
        CoordError::is_retryable(self)
    }
}

/// Remote-call failures carry no classification; retry them within budget.
impl Retryable for anyhow::Error {
    fn is_retryable(&self) -> bool {
        match self.downcast_ref::<CoordError>() {
            Some(err) => err.is_retryable(),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Same delay between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay after the `attempt`-th failure (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. The last error is returned as is.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(out) => return Ok(out),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !err.is_retryable() {
                    if attempt > 1 {
                        tracing::warn!(operation, attempts = attempt, error = %err, "giving up");
                    }
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after error"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;
    use trellis_common::OperationClass;

    use super::*;

    fn busy() -> CoordError {
        CoordError::LockTimeout {
            resource_key: "t1:answers".into(),
            class: OperationClass::Write,
            waited_ms: 15_000,
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let result = retry(&RetryPolicy::default(), "test", || async { Ok::<_, CoordError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let start = Instant::now();

        let result = retry(&RetryPolicy::default(), "write_range", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // 200ms + 400ms of backoff.
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let policy = RetryPolicy::fixed(4, Duration::from_millis(10));

        let result: Result<(), anyhow::Error> = retry(&policy, "append_rows", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("503 from remote store"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), CoordError> = retry(&RetryPolicy::default(), "read", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(CoordError::invalid_scope("missing tenant"))
            }
        })
        .await;

        assert!(matches!(result, Err(CoordError::InvalidScope(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(1000));
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }
}
