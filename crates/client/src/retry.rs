//! Retry logic with exponential backoff for connection establishment.

use std::{
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use rand::Rng;

use crate::{
    error::{ConnectError, Result},
    options::RetryPolicy,
};

/// Executes an async operation with retry using exponential backoff.
///
/// Errors for which [`ConnectError::is_retryable`] is false are returned immediately. When every
/// attempt fails with a retryable error, [`ConnectError::RetryExhausted`] is returned.
///
/// # Retry Strategy
///
/// - **Exponential backoff**: `initial_backoff * multiplier^(attempt-1)`, capped at `max_backoff`
/// - **Jitter**: the sleep is randomized within ±`jitter` of the backoff
/// - **Termination**: after `max_attempts` failed attempts
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    // backon counts retries, not attempts.
    let max_retries = policy.max_attempts.saturating_sub(1) as usize;

    let backoff = ExponentialBuilder::new()
        .with_min_delay(policy.initial_backoff)
        .with_max_delay(policy.max_backoff)
        .with_factor(policy.multiplier as f32)
        .with_max_times(max_retries);

    let retries = AtomicU32::new(0);
    let jitter = policy.jitter;

    operation
        .retry(backoff)
        .sleep(move |dur| tokio::time::sleep(apply_jitter(dur, jitter)))
        .when(ConnectError::is_retryable)
        .notify(|err: &ConnectError, dur: Duration| {
            let attempt = retries.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(
                attempt,
                backoff_ms = dur.as_millis() as u64,
                error = %err,
                "Retrying connection after backoff"
            );
        })
        .await
        .map_err(|e| {
            if e.is_retryable() {
                ConnectError::RetryExhausted {
                    attempts: retries.load(Ordering::SeqCst) + 1,
                    last_error: e.to_string(),
                }
            } else {
                e
            }
        })
}

/// Applies jitter to a duration.
///
/// The result lies in `[dur * (1 - factor), dur * (1 + factor)]`.
fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || dur.is_zero() {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rand::rng().random_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn unreachable_host() -> ConnectError {
        ConnectError::NoAddresses { target: "db.internal:443".to_string() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&test_policy(), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ConnectError>("connected")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&test_policy(), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unreachable_host())
                } else {
                    Ok("connected")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = with_retry(&test_policy(), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(unreachable_host())
            }
        })
        .await
        .unwrap_err();

        match err {
            ConnectError::RetryExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("db.internal:443"));
            },
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returned_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = with_retry(&test_policy(), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ConnectError::UnregisteredCompressor { name: "snappy".to_string() })
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ConnectError::UnregisteredCompressor { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_policy_makes_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = with_retry(&RetryPolicy::no_retry(), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(unreachable_host())
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ConnectError::RetryExhausted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        let dur = Duration::from_millis(250);
        assert_eq!(apply_jitter(dur, 0.0), dur);
        assert_eq!(apply_jitter(Duration::ZERO, 0.5), Duration::ZERO);
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn jitter_stays_within_bounds(millis in 1u64..10_000, factor in 0.0f64..=1.0) {
                let dur = Duration::from_millis(millis);
                let jittered = apply_jitter(dur, factor).as_nanos() as f64;
                let base = dur.as_nanos() as f64;
                // Truncation to whole nanoseconds can shave at most one off the lower bound.
                prop_assert!(jittered >= base * (1.0 - factor) - 1.0);
                prop_assert!(jittered <= base * (1.0 + factor));
            }

            #[test]
            fn jitter_factor_is_clamped(millis in 1u64..10_000, factor in 1.0f64..100.0) {
                let dur = Duration::from_millis(millis);
                prop_assert!(apply_jitter(dur, factor) <= dur * 2);
            }
        }
    }
}
