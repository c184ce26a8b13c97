//! Bounded retry with backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::service::ServiceError;
use crate::store::StoreError;

/// Exponential backoff for store operations that lost a lock or a
/// serialization race: `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retrying.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(50), Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Pause after the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(doublings) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        2u32.checked_pow(doublings)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy gives up.
///
/// Only [`StoreError::is_transient`] failures are retried. Exhausting the
/// policy yields [`ServiceError::Transient`]; everything else is mapped
/// through `From<StoreError>` unchanged.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_transient() => {
                warn!(operation, attempt, error = %err, "retries exhausted");
                return Err(ServiceError::Transient {
                    operation,
                    attempts: attempt,
                    message: err.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use stockshift_core::DomainError;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::exponential(
            6,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_counts_total_attempts() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!quick(1).should_retry(1));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let value = retry_transient(&quick(3), "append_event", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::LockTimeout("busy".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient() {
        let err = retry_transient(&quick(2), "confirm_transfer", || async {
            Err::<(), _>(StoreError::Transient("serialization failure".to_string()))
        })
        .await
        .unwrap_err();

        match err {
            ServiceError::Transient { attempts, operation, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(operation, "confirm_transfer");
            }
            other => panic!("expected Transient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn domain_failures_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let err = retry_transient(&quick(5), "append_event", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::Domain(DomainError::validation("empty-lines")))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ServiceError::Domain(DomainError::Validation(_))));
    }
}
