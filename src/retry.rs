//! Explicit bounded retry.
//!
//! [`retry`] runs an async operation up to `max_attempts` times. Each
//! attempt is cut off after `attempt_timeout`; the loop stops at the first
//! success. When every attempt fails, the error of the *last* attempt is
//! returned unchanged inside [`RetryExhausted`].
//!
//! Backoff doubles from `backoff` after each failure: 1×, 2×, 4×, ... capped
//! at 2^5.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn once(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout,
            backoff: Duration::ZERO,
        }
    }

    fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.backoff * (1u32 << (attempt - 2).min(5))
    }
}

/// Why a single attempt failed.
#[derive(Debug, Error, PartialEq)]
pub enum AttemptError<E> {
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Failed(E),
}

/// Every attempt failed.
#[derive(Debug, Error, PartialEq)]
#[error("{last} (after {attempts} attempt(s))")]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: AttemptError<E>,
}

impl<E: std::fmt::Display> RetryExhausted<E> {
    /// Message of the last attempt's error, without the attempt count.
    pub fn last_message(&self) -> String {
        self.last.to_string()
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last = None;

    for attempt in 1..=max_attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                tracing::debug!(attempt, max_attempts, error = %e, "attempt failed");
                last = Some(AttemptError::Failed(e));
            }
            Err(_) => {
                tracing::debug!(attempt, max_attempts, "attempt timed out");
                last = Some(AttemptError::TimedOut(policy.attempt_timeout));
            }
        }
    }

    Err(RetryExhausted {
        attempts: max_attempts,
        // The loop runs at least once, so `last` is always set here.
        last: last.unwrap_or(AttemptError::TimedOut(policy.attempt_timeout)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            attempt_timeout: Duration::from_millis(200),
            backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_stops_on_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast(5), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("boom {}", attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_surfaces_last_error() {
        let result: Result<(), _> =
            retry(&fast(3), |attempt| async move { Err(format!("boom {}", attempt)) }).await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_message(), "boom 3");
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(20),
            backoff: Duration::ZERO,
        };
        let result: Result<(), RetryExhausted<String>> = retry(&policy, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err.last, AttemptError::TimedOut(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let calls = AtomicU32::new(0);
        let _: Result<(), _> = retry(&fast(0), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope") }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            attempt_timeout: Duration::from_secs(1),
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(400));
        assert_eq!(policy.delay_before(9), Duration::from_millis(3200));
    }
}
