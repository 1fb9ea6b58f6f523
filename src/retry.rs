//! Retry-until-deadline helper.
//!
//! Call sites tag each failure as [`RetryError::Retryable`] or
//! [`RetryError::Permanent`]; [`retry_until`] re-invokes the operation with
//! exponential backoff while it is retryable and the deadline has not passed.
//!
//! # Example
//!
//! ```ignore
//! use gke_node_pool_provider::retry::{retry_until, RetryConfig, RetryError};
//!
//! let operation = retry_until(&RetryConfig::default(), timeout, "create node pool", || async {
//!     api.create_node_pool(&parent, &pool, None).await.map_err(|e| {
//!         if e.is_failed_precondition() {
//!             RetryError::Retryable(e)
//!         } else {
//!             RetryError::Permanent(e)
//!         }
//!     })
//! })
//! .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff parameters for [`retry_until`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after every retry.
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Poll at a fixed interval with no jitter.
    pub fn fixed(interval: Duration) -> Self {
        let ms = interval.as_millis().min(u64::MAX as u128) as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.backoff_multiplier.max(1.0);
        Duration::from_secs_f64(next.min(self.max_delay_ms as f64 / 1000.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Classification of a single failed attempt.
///
/// `P` defaults to `E`; pollers use a separate progress type for `E`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E, P = E> {
    /// Try again after a delay.
    Retryable(E),
    /// Give up immediately.
    Permanent(P),
}

/// Why [`retry_until`] stopped without a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure<E, P = E> {
    /// An attempt failed with a permanent error.
    Permanent(P),
    /// The deadline passed; `last_error` is the most recent retryable failure.
    TimedOut {
        /// The last retryable error seen, if any attempt ran.
        last_error: Option<E>,
        /// The deadline that elapsed.
        timeout: Duration,
    },
}

/// Invoke `operation` until it succeeds, fails permanently, or `timeout` elapses.
///
/// The first attempt always runs. Sleeps never extend past the deadline, and
/// no attempt starts after it.
pub async fn retry_until<F, Fut, T, E, P>(
    config: &RetryConfig,
    timeout: Duration,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryFailure<E, P>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError<E, P>>>,
    E: Display,
{
    let deadline = Instant::now() + timeout;
    let mut delay = config.initial_delay();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = %operation_name,
                        attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(RetryError::Permanent(e)) => return Err(RetryFailure::Permanent(e)),
            Err(RetryError::Retryable(e)) => e,
        };

        let now = Instant::now();
        if now >= deadline {
            warn!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Giving up, deadline exceeded"
            );
            return Err(RetryFailure::TimedOut {
                last_error: Some(err),
                timeout,
            });
        }

        let sleep_for = config.jittered(delay).min(deadline - now);
        debug!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = sleep_for.as_millis() as u64,
            "Not done yet, retrying"
        );

        tokio::time::sleep(sleep_for).await;
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig::fixed(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, RetryFailure<&str>> =
            retry_until(&fast(), Duration::from_secs(1), "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_retryable_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, RetryFailure<&str>> =
            retry_until(&fast(), Duration::from_secs(5), "op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RetryError::Retryable("busy"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, RetryFailure<&str>> =
            retry_until(&fast(), Duration::from_secs(5), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(RetryError::Permanent("denied"))
                }
            })
            .await;

        assert_eq!(result, Err(RetryFailure::Permanent("denied")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_may_have_its_own_type() {
        let result: Result<i32, RetryFailure<&str, u16>> =
            retry_until(&fast(), Duration::from_secs(5), "op", || async {
                Err(RetryError::Permanent(404))
            })
            .await;

        assert_eq!(result, Err(RetryFailure::Permanent(404)));
    }

    #[tokio::test]
    async fn test_times_out_with_last_error() {
        let result: Result<i32, RetryFailure<&str>> =
            retry_until(&fast(), Duration::from_millis(20), "op", || async {
                Err(RetryError::Retryable("still busy"))
            })
            .await;

        match result {
            Err(RetryFailure::TimedOut {
                last_error,
                timeout,
            }) => {
                assert_eq!(last_error, Some("still busy"));
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_timeout_still_attempts_once() {
        let result: Result<i32, RetryFailure<&str>> =
            retry_until(&fast(), Duration::ZERO, "op", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 250,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let d1 = config.next_delay(config.initial_delay());
        assert_eq!(d1, Duration::from_millis(200));
        let d2 = config.next_delay(d1);
        assert_eq!(d2, Duration::from_millis(250));
        assert_eq!(config.jittered(d2), d2);
    }

    #[test]
    fn test_fixed_interval() {
        let config = RetryConfig::fixed(Duration::from_secs(10));
        let d = config.initial_delay();
        assert_eq!(d, Duration::from_secs(10));
        assert_eq!(config.next_delay(d), Duration::from_secs(10));
    }
}
