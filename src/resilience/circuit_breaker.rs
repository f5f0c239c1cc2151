//! # Circuit Breaker
//!
//! Classic three-state breaker (Closed, Open, HalfOpen) guarding the
//! generation service. Trip state is process-local and resets with the
//! process. The open timestamp and call counters are explicit fields so
//! state is fully inspectable in tests.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::CircuitBreakerSettings;

/// Operational mode of the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed = 0,
    /// Failing fast, calls are rejected without executing
    Open = 1,
    /// Testing recovery with a limited number of probe calls
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

/// Error wrapper distinguishing a rejected call from a failed one
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug, Default)]
struct Counters {
    total_calls: u64,
    failure_count: u64,
    half_open_successes: u32,
    half_open_inflight: u32,
}

/// Circuit breaker with atomic state and mutex-guarded counters
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    settings: CircuitBreakerSettings,
    counters: Mutex<Counters>,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: CircuitBreakerSettings) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            settings,
            counters: Mutex::new(Counters::default()),
            opened_at: Mutex::new(None),
        })
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Execute an operation under breaker protection.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.should_allow_call().await {
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result.map_err(CircuitBreakerError::OperationFailed)
    }

    async fn should_allow_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = self.opened_at.lock().await;
                match *opened_at {
                    Some(when)
                        if when.elapsed() >= Duration::from_secs(self.settings.cooldown_secs) =>
                    {
                        drop(opened_at);
                        self.transition_to_half_open().await;
                        self.counters.lock().await.half_open_inflight += 1;
                        true
                    }
                    Some(_) => false,
                    None => {
                        warn!(component = %self.name, "circuit open with no timestamp, allowing call");
                        true
                    }
                }
            }
            CircuitState::HalfOpen => {
                let mut counters = self.counters.lock().await;
                if counters.half_open_inflight + counters.half_open_successes
                    < self.settings.half_open_probes
                {
                    counters.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut counters = self.counters.lock().await;
        counters.total_calls += 1;
        match self.state() {
            CircuitState::HalfOpen => {
                counters.half_open_inflight = counters.half_open_inflight.saturating_sub(1);
                counters.half_open_successes += 1;
                if counters.half_open_successes >= self.settings.half_open_probes {
                    drop(counters);
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                warn!(component = %self.name, "success recorded while circuit open");
            }
        }
    }

    async fn record_failure(&self) {
        let mut counters = self.counters.lock().await;
        counters.total_calls += 1;
        counters.failure_count += 1;
        match self.state() {
            CircuitState::Closed => {
                // Trip only once enough calls have been observed
                if counters.total_calls >= self.settings.minimum_sample as u64
                    && counters.failure_count >= self.settings.failure_threshold as u64
                {
                    drop(counters);
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                counters.half_open_inflight = counters.half_open_inflight.saturating_sub(1);
                drop(counters);
                self.transition_to_open().await;
            }
            CircuitState::Open => {}
        }
    }

    async fn transition_to_closed(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        let mut counters = self.counters.lock().await;
        counters.failure_count = 0;
        counters.total_calls = 0;
        counters.half_open_successes = 0;
        counters.half_open_inflight = 0;
        *self.opened_at.lock().await = None;
        info!(component = %self.name, "circuit breaker closed (recovered)");
    }

    async fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.opened_at.lock().await = Some(Instant::now());
        let mut counters = self.counters.lock().await;
        counters.half_open_successes = 0;
        counters.half_open_inflight = 0;
        warn!(
            component = %self.name,
            failure_threshold = self.settings.failure_threshold,
            cooldown_secs = self.settings.cooldown_secs,
            "circuit breaker opened (failing fast)"
        );
    }

    async fn transition_to_half_open(&self) {
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);
        let mut counters = self.counters.lock().await;
        counters.half_open_successes = 0;
        counters.half_open_inflight = 0;
        info!(
            component = %self.name,
            probes = self.settings.half_open_probes,
            "circuit breaker half-open (testing recovery)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(
        failure_threshold: u32,
        minimum_sample: u32,
        cooldown_secs: u64,
        half_open_probes: u32,
    ) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold,
            minimum_sample,
            cooldown_secs,
            half_open_probes,
        }
    }

    #[tokio::test]
    async fn test_stays_closed_under_minimum_sample() {
        let breaker = CircuitBreaker::new("gen", settings(2, 10, 1, 1));

        // Failures below the minimum sample never trip the circuit
        for _ in 0..5 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_over_sample() {
        let breaker = CircuitBreaker::new("gen", settings(3, 5, 1, 1));

        for _ in 0..2 {
            let _ = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        }
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Calls are rejected without executing
        let result = breaker.call(|| async { Ok::<_, &str>("should not run") }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_half_open_probes() {
        let breaker = CircuitBreaker::new("gen", settings(1, 1, 5, 2));

        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;

        // Two successful probes close the circuit
        assert!(breaker.call(|| async { Ok::<_, &str>(()) }).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.call(|| async { Ok::<_, &str>(()) }).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("gen", settings(1, 1, 5, 2));

        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let _ = breaker.call(|| async { Err::<(), _>("still broken") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
