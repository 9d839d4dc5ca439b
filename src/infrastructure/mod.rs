//! Infrastructure layer modules
//!
//! - `config`: settings loaded from files and environment
//! - `error`: store and queue error types
//! - `metrics`: Prometheus metrics helpers
//! - `redis`: Redis connection pool, circuit breaker, and health checks

pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
