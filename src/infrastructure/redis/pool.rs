//! Redis connection pool backing the work queue store.
//!
//! Provides a managed multiplexed connection with circuit breaker
//! integration. Every store round-trip goes through [`RedisPool::execute`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;
use crate::metrics::StoreMetrics;

use super::{BackoffConfig, CircuitBreaker, CircuitState, ExponentialBackoff, RedisHealth};

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Circuit breaker is open
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// Connection not available
    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),

    /// The pool was closed by its owner
    #[error("Connection pool is closed")]
    Closed,
}

/// Redis connection pool for store operations.
///
/// Holds a single multiplexed connection shared by all queue handles that
/// use the same store. The connection is opened lazily, dropped on
/// connection-level errors so the next call reconnects, and released for
/// good by [`RedisPool::close`] or when the pool is dropped.
pub struct RedisPool {
    client: Client,

    /// Multiplexed connection (shared across tasks)
    connection: RwLock<Option<MultiplexedConnection>>,

    closed: AtomicBool,

    circuit_breaker: Arc<CircuitBreaker>,

    health: Arc<RedisHealth>,

    config: RedisConfig,
}

impl RedisPool {
    /// Create a new Redis pool. No connection is made until first use.
    pub fn new(
        config: RedisConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        health: Arc<RedisHealth>,
    ) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            closed: AtomicBool::new(false),
            circuit_breaker,
            health,
            config,
        })
    }

    /// Get the shared connection, establishing it if needed.
    ///
    /// Returns an error if the circuit breaker is open or the pool is closed.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        if !self.circuit_breaker.allow_request() {
            self.health.set_circuit_open();
            return Err(PoolError::CircuitOpen);
        }

        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Another task may have connected while we waited for the lock
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                self.health.set_connected();
                tracing::info!(url = %self.config.url, "Redis store connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                self.health.set_disconnected();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Connect eagerly, retrying with exponential backoff.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<(), PoolError> {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig::for_reconnect(&self.config));

        loop {
            match self.ping().await {
                Ok(()) => return Ok(()),
                Err(PoolError::Closed) => return Err(PoolError::Closed),
                Err(e) if backoff.attempt() + 1 >= max_attempts.max(1) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Redis not reachable yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run one Redis round-trip with circuit breaker bookkeeping.
    ///
    /// `operation` labels the latency histogram.
    pub async fn execute<F, T, Fut>(&self, operation: &'static str, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;
        let started = Instant::now();

        let result = f(conn).await;
        StoreMetrics::observe_latency("redis", operation, started.elapsed());

        match result {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    // Next call reconnects
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                    self.health.set_lost();
                }
                self.circuit_breaker.record_failure();
                StoreMetrics::record_error("redis", operation);
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Drop the connection and refuse further requests.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let released = self.connection.write().await.take();
        self.health.set_closed();
        if released.is_some() {
            tracing::info!(url = %self.config.url, "Redis store connection released");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Circuit breaker closed and connection established.
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn health(&self) -> &RedisHealth {
        &self.health
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute("ping", |mut conn| async move {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(pong)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::RedisHealthStatus;

    fn create_test_pool() -> (RedisPool, Arc<CircuitBreaker>) {
        let config = RedisConfig::default();
        let cb = Arc::new(CircuitBreaker::new());
        let health = Arc::new(RedisHealth::new());
        let pool = RedisPool::new(config, cb.clone(), health).unwrap();
        (pool, cb)
    }

    #[test]
    fn test_pool_creation() {
        let (pool, _) = create_test_pool();
        assert_eq!(pool.url(), "redis://localhost:6379");
        assert!(!pool.is_closed());
    }

    #[test]
    fn test_pool_rejects_invalid_url() {
        let config = RedisConfig {
            url: "not-a-redis-url".to_string(),
            ..Default::default()
        };
        let pool = RedisPool::new(
            config,
            Arc::new(CircuitBreaker::new()),
            Arc::new(RedisHealth::new()),
        );
        assert!(matches!(pool, Err(PoolError::Redis(_))));
    }

    #[test]
    fn test_pool_circuit_breaker_integration() {
        let (pool, cb) = create_test_pool();
        assert_eq!(pool.circuit_state(), CircuitState::Closed);

        for _ in 0..5 {
            cb.record_failure();
        }

        assert_eq!(pool.circuit_state(), CircuitState::Open);
        assert!(!pool.is_healthy());
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_requests() {
        let (pool, cb) = create_test_pool();
        for _ in 0..5 {
            cb.record_failure();
        }

        let result = pool.get_connection().await;
        assert!(matches!(result, Err(PoolError::CircuitOpen)));
        assert_eq!(pool.health().status(), RedisHealthStatus::CircuitOpen);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_requests() {
        let (pool, _) = create_test_pool();
        pool.close().await;

        assert!(pool.is_closed());
        assert!(matches!(pool.get_connection().await, Err(PoolError::Closed)));
        assert!(matches!(pool.connect_with_retry(3).await, Err(PoolError::Closed)));
    }
}
