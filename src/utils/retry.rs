// =============================================================================
// utils/retry.rs
// =============================================================================
// retry_transient - exponential backoff with full jitter for tier calls.
// Only errors the taxonomy marks transient (I/O failures and timeouts) are
// retried; integrity and validation errors surface on the first attempt.
// =============================================================================

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::EngineResult;

/// Default attempts including the first
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
/// Base backoff (ms)
const BACKOFF_BASE_MS: u64 = 50;
/// Maximum backoff cap (ms)
const BACKOFF_MAX_MS: u64 = 5000;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_ms: BACKOFF_BASE_MS,
            max_ms: BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// Full-jitter backoff: random(0, min(max, base * 2^(attempt-1)))
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1) as u32));
        let capped = exp.min(self.max_ms);
        Duration::from_millis(rand::thread_rng().gen_range(0..=capped))
    }
}

/// Run `op` with the default policy, retrying transient failures
///
/// # Example
/// ```no_run
/// use hydrotier::utils::retry::retry_transient;
///
/// async fn example() -> hydrotier::EngineResult<u64> {
///     retry_transient("warm write", || async { Ok(42) }).await
/// }
/// ```
pub async fn retry_transient<F, Fut, T>(scope: &str, op: F) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    retry_with_policy(scope, RetryPolicy::default(), op).await
}

pub async fn retry_with_policy<F, Fut, T>(scope: &str, policy: RetryPolicy, op: F) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                tracing::debug!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    scope,
                    attempt,
                    policy.max_attempts,
                    e,
                    backoff
                );
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff(1) <= Duration::from_millis(BACKOFF_BASE_MS));
        assert!(policy.backoff(3) <= Duration::from_millis(BACKOFF_BASE_MS * 4));
        assert!(policy.backoff(20) <= Duration::from_millis(BACKOFF_MAX_MS));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result = retry_transient("test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EngineError::transient("test", "flaky"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_integrity_errors_fail_fast() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: EngineResult<()> = retry_transient("test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::DataIntegrity("bad row".into()))
        })
        .await;
        assert!(matches!(result, Err(EngineError::DataIntegrity(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: EngineResult<()> = retry_transient("test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::transient("test", "down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_MAX_ATTEMPTS);
    }
}
