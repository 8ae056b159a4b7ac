//! Bounded exponential backoff for transient I/O failures

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};

use backoff::{future::retry_notify, ExponentialBackoff};

use crate::config::RetryPolicy;

/// Run `operation` under the retry policy, retrying errors that
/// `is_transient` accepts. The final error is surfaced unchanged once the
/// attempt budget is exhausted.
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    name: &'static str,
    is_transient: C,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let attempts = AtomicU32::new(0);
    let max_attempts = policy.max_attempts.max(1);
    let backoff = ExponentialBackoff {
        initial_interval: policy.base,
        max_interval: policy.cap,
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };

    retry_notify(
        backoff,
        || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let fut = operation();
            let is_transient = &is_transient;
            async move {
                fut.await.map_err(|err| {
                    if attempt >= max_attempts || !is_transient(&err) {
                        backoff::Error::permanent(err)
                    } else {
                        backoff::Error::transient(err)
                    }
                })
            }
        },
        |err, wait| {
            tracing::warn!(operation = name, error = %err, ?wait, "transient failure, retrying");
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Counter::new(0);
        let result: Result<u32, String> =
            with_retry(&fast_policy(5), "test", |_| true, || async {
                if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn surfaces_error_after_attempt_budget() {
        let calls = Counter::new(0);
        let result: Result<u32, String> =
            with_retry(&fast_policy(5), "test", |_| true, || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Err("still failing".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "still failing");
        assert_eq!(calls.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Counter::new(0);
        let result: Result<u32, String> =
            with_retry(&fast_policy(5), "test", |_| false, || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Err("permanent".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
