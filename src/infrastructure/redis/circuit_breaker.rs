//! Circuit breaker guarding store round-trips

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RedisConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through normally
    Closed,
    /// Requests are rejected without touching Redis
    Open,
    /// A few probe requests are let through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successful probes that close it again
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&RedisConfig::default())
    }
}

impl From<&RedisConfig> for CircuitBreakerConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            success_threshold: config.circuit_breaker_success_threshold.max(1),
            reset_timeout: Duration::from_secs(config.circuit_breaker_reset_timeout_seconds),
        }
    }
}

#[derive(Debug)]
enum Breaker {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// Circuit breaker in front of the Redis store.
///
/// A commit that loses an optimistic race is not a failure here; only
/// transport and server errors are recorded.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Breaker>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Breaker::Closed { failures: 0 }),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Breaker> {
        // State stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state. An open circuit turns half-open once the reset
    /// timeout has passed.
    pub fn state(&self) -> CircuitState {
        let mut breaker = self.lock();
        if let Breaker::Open { since } = *breaker {
            if since.elapsed() >= self.config.reset_timeout {
                *breaker = Breaker::HalfOpen { successes: 0 };
                tracing::info!("Store circuit half-open, probing");
            }
        }
        match *breaker {
            Breaker::Closed { .. } => CircuitState::Closed,
            Breaker::Open { .. } => CircuitState::Open,
            Breaker::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut breaker = self.lock();
        match *breaker {
            Breaker::Closed { ref mut failures } => *failures = 0,
            Breaker::HalfOpen { successes } if successes + 1 >= self.config.success_threshold => {
                *breaker = Breaker::Closed { failures: 0 };
                tracing::info!("Store circuit closed after successful probes");
            }
            Breaker::HalfOpen { ref mut successes } => *successes += 1,
            Breaker::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut breaker = self.lock();
        match *breaker {
            Breaker::Closed { failures } if failures + 1 >= self.config.failure_threshold => {
                *breaker = Breaker::Open {
                    since: Instant::now(),
                };
                tracing::warn!(failures = failures + 1, "Store circuit opened, rejecting requests");
            }
            Breaker::Closed { ref mut failures } => *failures += 1,
            Breaker::HalfOpen { .. } => {
                *breaker = Breaker::Open {
                    since: Instant::now(),
                };
                tracing::warn!("Store circuit reopened after failed probe");
            }
            Breaker::Open { ref mut since } => *since = Instant::now(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
