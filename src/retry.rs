// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bounded Fixed-Interval Retry
//!
//! Every supervisor recovers with the same policy: up to `max_retries`
//! sequential attempts with a fixed wait between two failures. Both the attempt
//! and the wait are raced against the supervisor's cancellation token.

use crate::errors::AmqpError;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many times, and how often, a supervisor tries to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

/// Runs `attempt` until it succeeds, the budget is spent or `token` is cancelled.
///
/// There is no wait after the final failure. An attempt that cannot run because
/// a dependency is closed should fail with [`AmqpError::ClosedError`]; it counts
/// against the budget like any other failure.
pub(crate) async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    token: &CancellationToken,
    resource: &str,
    mut attempt: F,
) -> Result<T, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let mut last_error = AmqpError::ClosedError;

    for n in 1..=policy.max_retries {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(AmqpError::Cancelled),
            result = attempt() => result,
        };

        match result {
            Ok(value) => {
                debug!(resource, attempt = n, "recovered");
                return Ok(value);
            }
            Err(err) => {
                warn!(
                    resource,
                    attempt = n,
                    max_retries = policy.max_retries,
                    error = err.to_string(),
                    "recovery attempt failed"
                );
                last_error = err;
            }
        }

        if n < policy.max_retries {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AmqpError::Cancelled),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    Err(AmqpError::RetriesExhausted(
        policy.max_retries,
        last_error.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };
    use tokio::time::Instant;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures_with_one_wait_per_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = retry(policy(20), &CancellationToken::new(), "test", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AmqpError::ConnectionError("refused".to_owned()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_error_without_trailing_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<(), _> = retry(policy(3), &CancellationToken::new(), "test", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AmqpError::ConnectionError("refused".to_owned()))
            }
        })
        .await;

        assert_eq!(
            result,
            Err(AmqpError::RetriesExhausted(
                3,
                AmqpError::ConnectionError("refused".to_owned()).to_string()
            ))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_never_attempts() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = retry(policy(0), &CancellationToken::new(), "test", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(AmqpError::RetriesExhausted(0, _))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let started = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = retry(policy(20), &token, "test", || async {
            Err(AmqpError::ClosedError)
        })
        .await;

        assert_eq!(result, Err(AmqpError::Cancelled));
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), _> =
            retry(policy(5), &token, "test", || std::future::pending()).await;

        assert_eq!(result, Err(AmqpError::Cancelled));
    }
}
