//! Circuit breaker pattern for source resilience.
//!
//! Bounds the blast radius of one flaky job board: after sustained failures
//! the source is skipped instead of hammered.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[window threshold]--> OPEN (skipping) --[cooldown]--> HALF_OPEN (one probe)
//!                                                                               |
//!                          OPEN <--[probe failure, cooldown doubled]------------+
//!                                                                               |
//! CLOSED <-----------------------[probe success]--------------------------------+
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are skipped without being attempted.
    Open,
    /// Circuit is half-open - exactly one probe is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub consecutive_failures: u32,

    /// Size of the sliding window of recent outcomes.
    pub window_size: usize,

    /// Failure ratio over a full window that opens the circuit.
    pub failure_ratio: f64,

    /// Cooldown before the first probe after opening.
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,

    /// Upper bound for the cooldown after repeated trips.
    #[serde(with = "duration_secs")]
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            window_size: 10,
            failure_ratio: 0.5,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(900),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.consecutive_failures == 0 {
            return Err(AppError::ConfigError(
                "circuit breaker consecutive_failures must be at least 1".into(),
            ));
        }
        if self.window_size == 0 {
            return Err(AppError::ConfigError(
                "circuit breaker window_size must be at least 1".into(),
            ));
        }
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(AppError::ConfigError(format!(
                "circuit breaker failure_ratio must be in (0, 1], got {}",
                self.failure_ratio
            )));
        }
        if self.max_cooldown < self.cooldown {
            return Err(AppError::ConfigError(
                "circuit breaker max_cooldown must not be below cooldown".into(),
            ));
        }
        Ok(())
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    /// Consecutive failures since the last success.
    failure_count: u32,
    /// Recent outcomes, `true` = failure. Newest at the back.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    current_cooldown: Duration,
    trips: u32,
    last_error_message: Option<String>,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            window: VecDeque::with_capacity(config.window_size),
            opened_at: None,
            opened_at_utc: None,
            probe_in_flight: false,
            current_cooldown: config.cooldown,
            trips: 0,
            last_error_message: None,
        }
    }

    fn remaining_cooldown(&self) -> Option<Duration> {
        self.opened_at
            .map(|t| self.current_cooldown.saturating_sub(t.elapsed()))
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub window_failures: usize,
    pub window_len: usize,
    pub trips: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - the call was skipped without contacting the source.
    Open { name: String, retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Per-source circuit breaker.
///
/// Checks are synchronous and never block on I/O; the mutex is only held
/// for a handful of field updates.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open = if inner.state == CircuitState::Open {
            inner.remaining_cooldown()
        } else {
            None
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            window_failures: inner.window.iter().filter(|f| **f).count(),
            window_len: inner.window.len(),
            trips: inner.trips,
            opened_at: inner.opened_at_utc,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Time left before the next probe is permitted, if the circuit is open.
    pub fn retry_after(&self) -> Option<Duration> {
        self.stats().time_until_half_open
    }

    /// Ask permission to call the source.
    ///
    /// Closed: always true. Open: false until the cooldown elapses.
    /// HalfOpen: true exactly once; further callers are refused until the
    /// probe's outcome is recorded.
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// `None` when refused, `Some(true)` when the caller holds the probe slot.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => None,
            CircuitState::HalfOpen if inner.probe_in_flight => None,
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Some(true)
            }
        }
    }

    /// Record the outcome of a call that `allow()` permitted.
    pub fn record(&self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.record_failure_message("call failed");
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// Only errors for which [`AppError::should_trip_circuit`] holds count as
    /// failures; other errors are returned without touching the breaker.
    /// A half-open probe dropped before it finishes (timeout, cancellation)
    /// counts as a failed probe.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let Some(is_probe) = self.admit() else {
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after: self.retry_after().unwrap_or(Duration::ZERO),
            });
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };
        let result = operation().await;
        guard.armed = false;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => self.release_probe(),
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        self.push_outcome(&mut inner, false);
        inner.failure_count = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                inner.opened_at_utc = None;
                inner.probe_in_flight = false;
                inner.last_error_message = None;
                inner.current_cooldown = self.config.cooldown;
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        self.record_failure_message(&error.to_string());
    }

    fn record_failure_message(&self, message: &str) {
        let mut inner = self.lock_inner();
        inner.last_error_message = Some(message.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                self.push_outcome(&mut inner, true);

                let window_failures = inner.window.iter().filter(|f| **f).count();
                let window_full = inner.window.len() >= self.config.window_size;
                let ratio_tripped = window_full
                    && window_failures as f64 / inner.window.len() as f64
                        >= self.config.failure_ratio;

                if inner.failure_count >= self.config.consecutive_failures || ratio_tripped {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        window_failures,
                        error = %message,
                        "Circuit breaker opening"
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %message,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.current_cooldown = std::cmp::min(
                    inner.current_cooldown.saturating_mul(2),
                    self.config.max_cooldown,
                );
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open probe slot without recording an outcome.
    fn release_probe(&self) {
        let mut inner = self.lock_inner();
        inner.probe_in_flight = false;
    }

    fn abandon_probe(&self) {
        let mut inner = self.lock_inner();
        if inner.state != CircuitState::HalfOpen || !inner.probe_in_flight {
            return;
        }
        drop(inner);
        self.record_failure_message("probe abandoned before completing");
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::new(&self.config);
    }

    /// Force the circuit open, e.g. when restoring a tripped source.
    pub fn trip(&self) {
        let mut inner = self.lock_inner();
        self.open(&mut inner);
    }

    fn open(&self, inner: &mut CircuitBreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_utc = Some(Utc::now());
        inner.probe_in_flight = false;
        inner.trips += 1;
        tracing::info!(
            circuit = %self.name,
            cooldown_secs = inner.current_cooldown.as_secs(),
            trips = inner.trips,
            "Circuit breaker open"
        );
    }

    fn push_outcome(&self, inner: &mut CircuitBreakerInner, failed: bool) {
        if inner.window.len() >= self.config.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_cooldown
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}

/// Settles a half-open probe whose future is dropped mid-call.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            consecutive_failures: 3,
            cooldown: Duration::from_millis(10),
            max_cooldown: Duration::from_millis(40),
            ..Default::default()
        }
    }

    fn fail(cb: &CircuitBreaker) {
        cb.record_failure(&AppError::unavailable("test", "503"));
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_circuit_opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            assert!(cb.allow());
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn test_circuit_stays_closed_below_threshold() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        for _ in 0..4 {
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let config = CircuitBreakerConfig {
            window_size: 100,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);
        for _ in 0..4 {
            fail(&cb);
        }
        cb.record_success();
        for _ in 0..4 {
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failure_ratio_over_full_window_opens() {
        // Alternating outcomes never reach 5 consecutive failures, but a
        // full window of 10 at 50% failures trips the ratio rule.
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        for _ in 0..4 {
            cb.record_success();
            fail(&cb);
        }
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_circuit_transitions_to_half_open_after_cooldown() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.trip();
        assert!(!cb.allow());

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_permits_exactly_one_probe() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.trip();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow());
        assert!(!cb.allow());
        assert!(!cb.allow());
    }

    #[test]
    fn test_half_open_success_closes_and_resets() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            fail(&cb);
        }
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow());
        cb.record(true);

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert!(cb.allow());
    }

    #[test]
    fn test_half_open_failure_reopens_with_doubled_cooldown() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.trip();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow());
        cb.record(false);

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.time_until_half_open.unwrap() > Duration::from_millis(10));
        assert_eq!(stats.trips, 2);
    }

    #[test]
    fn test_cooldown_doubling_is_capped() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.trip();
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(45));
            assert!(cb.allow());
            cb.record(false);
        }
        assert!(cb.stats().time_until_half_open.unwrap() <= Duration::from_millis(40));
    }

    #[test]
    fn test_manual_reset() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        cb.trip();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().trips, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let bad = CircuitBreakerConfig {
            failure_ratio: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = CircuitBreakerConfig {
            consecutive_failures: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_seconds() {
        let config: CircuitBreakerConfig =
            serde_json::from_str(r#"{"consecutive_failures": 2, "cooldown": 1.5}"#).unwrap();
        assert_eq!(config.consecutive_failures, 2);
        assert_eq!(config.cooldown, Duration::from_millis(1500));
        assert_eq!(config.window_size, 10);
    }

    #[tokio::test]
    async fn test_call_skips_when_circuit_open() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        cb.trip();

        let result = cb
            .call(|| async { Ok::<_, AppError>("should not execute".to_string()) })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn test_call_executes_when_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        let result = cb
            .call(|| async { Ok::<_, AppError>("success".to_string()) })
            .await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn test_abandoned_probe_reopens_circuit() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.trip();
        std::thread::sleep(Duration::from_millis(20));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cb.call(std::future::pending::<Result<(), AppError>>),
        )
        .await;
        assert!(abandoned.is_err());

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.trips, 2);

        // Doubled cooldown (20ms) elapses and a new probe is admitted.
        std::thread::sleep(Duration::from_millis(45));
        assert!(cb.allow());
    }

    #[tokio::test]
    async fn test_abandoned_call_while_closed_is_not_a_failure() {
        let cb = CircuitBreaker::new("test", fast_config());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cb.call(std::future::pending::<Result<(), AppError>>),
        )
        .await;
        assert!(abandoned.is_err());

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn test_call_ignores_non_tripping_errors() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        let _ = cb
            .call(|| async { Err::<String, _>(AppError::auth("test", "401")) })
            .await;
        let _ = cb
            .call(|| async { Err::<String, _>(AppError::unavailable("test", "503")) })
            .await;

        assert_eq!(cb.stats().failure_count, 1);
    }
}
