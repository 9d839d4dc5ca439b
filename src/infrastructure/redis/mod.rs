//! Redis connectivity for the store backend
//!
//! - `RedisPool`: shared multiplexed connection used by `RedisStore`
//! - `CircuitBreaker`: stops hammering Redis while it is down
//! - `ExponentialBackoff`: delays for reconnects and commit retries
//! - `RedisHealth`: connection status tracking

mod backoff;
mod circuit_breaker;
mod health;
pub mod pool;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health::{RedisHealth, RedisHealthSnapshot, RedisHealthStatus};
pub use pool::{PoolError, RedisPool};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
