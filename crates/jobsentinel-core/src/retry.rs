use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerError;
use crate::error::AppError;

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for AppError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

impl Transient for CircuitBreakerError {
    fn is_transient(&self) -> bool {
        match self {
            // An open circuit will not close within a backoff window.
            CircuitBreakerError::Open { .. } => false,
            CircuitBreakerError::Inner(e) => e.is_retryable(),
        }
    }
}

/// Bounded retry with exponential backoff, applied uniformly around every
/// adapter call.
///
/// Delay schedule with defaults: 1s, 2s, 4s, then give up for this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Limiter cooldown after a 429 that carried no `Retry-After`.
    pub rate_limit_cooldown_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            rate_limit_cooldown_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    /// Delay before retry number `retry` (1-indexed): base · 2^(retry-1), capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. The closure receives the 1-indexed attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let delay = self.delay_for_retry(attempt);
                    tracing::warn!(
                        target_name = %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_retry_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .run("test", |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AppError::unavailable("test", "503"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), AppError> = policy
            .run("test", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::unavailable("test", "503"))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::SourceUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), AppError> = policy
            .run("test", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::auth("test", "401"))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::SourceAuthError { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_circuit_is_not_transient() {
        let open = CircuitBreakerError::Open {
            name: "x".into(),
            retry_after: Duration::from_secs(1),
        };
        assert!(!open.is_transient());
        assert!(CircuitBreakerError::Inner(AppError::Timeout(5)).is_transient());
    }
}
