use crate::error::ExecError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total submission attempts per send, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Extra tries for a single read-only network step (nonce, estimate, ...).
    pub transient_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(15),
            transient_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry - 1), capped.
    ///
    /// Must stay cheap for large `retry` values.
    pub fn backoff(&self, retry: u32) -> Duration {
        let max = self.backoff_max.max(Duration::from_millis(1));
        let base = self.backoff_base.min(max);
        let exp = retry.saturating_sub(1).min(31);
        base.checked_mul(1u32 << exp).unwrap_or(max).min(max)
    }
}

/// Retries `f` on [`ExecError::TransientNetwork`] with backoff, up to
/// `policy.transient_retries` extra tries. Other errors pass straight through.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, what: &str, mut f: F) -> Result<T, ExecError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExecError>>,
{
    let mut retry = 0u32;
    loop {
        match f().await {
            Err(ExecError::TransientNetwork(msg)) if retry < policy.transient_retries => {
                retry += 1;
                let delay = policy.backoff(retry);
                tracing::warn!(step = what, retry, delay_ms = delay.as_millis() as u64, error = %msg, "transient failure; retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(4), Duration::from_secs(8));
        assert_eq!(p.backoff(5), Duration::from_secs(15));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_then_surface() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let out: Result<(), ExecError> = retry_transient(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecError::TransientNetwork("down".into())) }
        })
        .await;
        assert!(matches!(out, Err(ExecError::TransientNetwork(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1 + policy.transient_retries);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), ExecError> = retry_transient(&RetryPolicy::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecError::SimulationReverted { reason: None }) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
