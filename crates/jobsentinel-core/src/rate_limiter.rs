//! Per-source token bucket for polite fetching.
//!
//! Every source adapter gets its own bucket so one busy board never slows
//! another down. Refill is lazy: tokens are recomputed from elapsed time on
//! each `acquire`, there is no background timer.
//!
//! # Example
//!
//! ```rust,no_run
//! use jobsentinel_core::rate_limiter::{RateLimitConfig, TokenBucket};
//!
//! # async fn run() -> Result<(), jobsentinel_core::AppError> {
//! // Bursts of 5 requests, then one request every two seconds.
//! let bucket = TokenBucket::new("greenhouse", RateLimitConfig::new(5, 0.5))?;
//! bucket.acquire(1).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;

/// Longest cooldown a single source pushback can impose.
pub const MAX_PENALTY: Duration = Duration::from_secs(900);

/// Bucket sizing for one source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of tokens (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl RateLimitConfig {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Reject bucket shapes that could never grant a token.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.capacity == 0 {
            return Err(AppError::ConfigError(
                "rate limit capacity must be at least 1".into(),
            ));
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "rate limit refill_per_sec must be positive, got {}",
                self.refill_per_sec
            )));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    /// Burst of 5, then one request per second.
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    /// Current tokens. Negative while callers hold reservations.
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by the tasks of a single source.
///
/// Refill and debit happen under one lock, so concurrent callers can never
/// be granted more tokens than have accrued. A caller that has to wait
/// reserves its tokens before releasing the lock (driving the balance
/// negative) and sleeps outside it; later callers queue up behind the
/// reservation.
#[derive(Clone)]
pub struct TokenBucket {
    name: String,
    config: RateLimitConfig,
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucket {
    /// Create a full bucket. Fails if the configuration is unusable.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(BucketState {
                tokens: f64::from(config.capacity),
                last_refill: Instant::now(),
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Fail fast on requests that exceed the bucket capacity.
    ///
    /// Called at startup for each configured per-request cost so the error
    /// never first appears mid-run.
    pub fn check_request(&self, n: u32) -> Result<(), AppError> {
        if n > self.config.capacity {
            return Err(AppError::InvalidRateLimitRequest {
                requested: n,
                capacity: self.config.capacity,
            });
        }
        Ok(())
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.config.refill_per_sec)
                .min(f64::from(self.config.capacity));
            state.last_refill = now;
        }
    }

    /// Take `n` tokens, suspending until they have accrued.
    ///
    /// The wait is exactly `(n - T) / R` seconds for the balance `T` seen
    /// under the lock.
    pub async fn acquire(&self, n: u32) -> Result<(), AppError> {
        self.check_request(n)?;
        let wait = {
            let mut state = self.state.lock().await;
            self.refill(&mut state, Instant::now());
            let needed = f64::from(n);
            let deficit = needed - state.tokens;
            state.tokens -= needed;
            if deficit <= 0.0 {
                return Ok(());
            }
            Duration::try_from_secs_f64(deficit / self.config.refill_per_sec)
                .unwrap_or(MAX_PENALTY)
        };

        tracing::debug!(
            bucket = %self.name,
            sleep_ms = %wait.as_millis(),
            "Rate limiting request"
        );
        tokio::time::sleep(wait).await;
        Ok(())
    }

    /// Non-blocking variant: take `n` tokens only if they are available now.
    pub async fn try_acquire(&self, n: u32) -> Result<bool, AppError> {
        self.check_request(n)?;
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        if state.tokens >= f64::from(n) {
            state.tokens -= f64::from(n);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Force an extra cooldown after the source pushed back (HTTP 429).
    ///
    /// Drains the bucket so the next token accrues no earlier than
    /// `cooldown` from now. Cooldowns above [`MAX_PENALTY`] are clamped.
    pub async fn penalize(&self, cooldown: Duration) {
        let cooldown = cooldown.min(MAX_PENALTY);
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        let debt = cooldown.as_secs_f64() * self.config.refill_per_sec;
        state.tokens = state.tokens.min(0.0) - debt;
        tracing::info!(
            bucket = %self.name,
            cooldown_secs = cooldown.as_secs_f64(),
            "Rate limiter cooling down after source pushback"
        );
    }

    /// Tokens currently available (after refill). Negative values mean
    /// outstanding reservations.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(RateLimitConfig::new(5, 1.0).validate().is_ok());
        assert!(RateLimitConfig::new(0, 1.0).validate().is_err());
        assert!(RateLimitConfig::new(5, 0.0).validate().is_err());
        assert!(RateLimitConfig::new(5, f64::NAN).validate().is_err());
        assert!(TokenBucket::new("bad", RateLimitConfig::new(0, 1.0)).is_err());
    }

    #[tokio::test]
    async fn request_above_capacity_fails_fast() {
        let bucket = TokenBucket::new("test", RateLimitConfig::new(3, 1.0)).unwrap();
        let err = bucket.acquire(4).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidRateLimitRequest {
                requested: 4,
                capacity: 3
            }
        ));
        assert!(bucket.check_request(3).is_ok());
    }

    #[tokio::test]
    async fn burst_up_to_capacity_does_not_wait() {
        let bucket = TokenBucket::new("test", RateLimitConfig::new(5, 1.0)).unwrap();

        let start = std::time::Instant::now();
        for _ in 0..5 {
            bucket.acquire(1).await.unwrap();
        }

        assert!(
            start.elapsed() < Duration::from_millis(50),
            "Burst within capacity should not be delayed, elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn empty_bucket_waits_one_refill_interval() {
        // R = 10/s, so one token takes 100ms.
        let bucket = TokenBucket::new("test", RateLimitConfig::new(2, 10.0)).unwrap();
        bucket.acquire(2).await.unwrap();

        let start = std::time::Instant::now();
        bucket.acquire(1).await.unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(95),
            "Next acquire should wait ~1/R, elapsed: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn concurrent_acquires_are_not_over_granted() {
        // Capacity 1 at 20 tokens/s: three callers need 0ms, 50ms, 100ms.
        let bucket = TokenBucket::new("test", RateLimitConfig::new(1, 20.0)).unwrap();

        let start = std::time::Instant::now();
        let (a, b, c) = tokio::join!(bucket.acquire(1), bucket.acquire(1), bucket.acquire(1));
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert!(
            start.elapsed() >= Duration::from_millis(95),
            "Three tokens from a 1-token bucket need two refills, elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn try_acquire_does_not_block() {
        let bucket = TokenBucket::new("test", RateLimitConfig::new(1, 1.0)).unwrap();
        assert!(bucket.try_acquire(1).await.unwrap());
        assert!(!bucket.try_acquire(1).await.unwrap());
    }

    #[tokio::test]
    async fn refill_is_capped_at_capacity() {
        let bucket = TokenBucket::new("test", RateLimitConfig::new(2, 1000.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bucket.available().await <= 2.0);
    }

    #[tokio::test]
    async fn penalize_forces_cooldown() {
        let bucket = TokenBucket::new("test", RateLimitConfig::new(5, 100.0)).unwrap();
        bucket.penalize(Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        bucket.acquire(1).await.unwrap();

        assert!(
            start.elapsed() >= Duration::from_millis(100),
            "Acquire after penalty should wait out the cooldown, elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_penalty_is_clamped() {
        let bucket = TokenBucket::new("test", RateLimitConfig::new(5, 1.0)).unwrap();
        bucket.penalize(Duration::from_secs(u64::MAX)).await;
        assert!(bucket.available().await >= -MAX_PENALTY.as_secs_f64() - 1e-6);

        let start = Instant::now();
        bucket.acquire(1).await.unwrap();
        let waited = start.elapsed();

        assert!(waited >= MAX_PENALTY, "waited {waited:?}");
        assert!(waited <= MAX_PENALTY + Duration::from_secs(2), "waited {waited:?}");
    }

    #[test]
    fn default_config_is_sensible() {
        let config = RateLimitConfig::default();
        assert_eq!(config.capacity, 5);
        assert_eq!(config.refill_per_sec, 1.0);
    }
}
