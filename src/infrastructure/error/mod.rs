//! Error types shared by the store backends and the work queues.

use thiserror::Error;

use crate::redis::pool::PoolError;

/// Errors raised by a [`WorkQueueStore`](crate::store::WorkQueueStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis command or script failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connection pool could not serve the request
    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    /// The store handle was closed
    #[error("Store is closed")]
    Closed,

    /// The backend answered with something the client cannot interpret
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

/// The limit an over-capacity enqueue ran into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityLimit {
    /// Too many distinct partition keys are tracked
    Partitions { max: usize },
    /// The partition's record is full
    Items { key: String, max: usize },
}

impl std::fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Partitions { max } => write!(f, "partition limit of {} reached", max),
            Self::Items { key, max } => {
                write!(f, "partition {} already holds {} items", key, max)
            }
        }
    }
}

impl CapacityLimit {
    /// Label used for the capacity rejection metric
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Partitions { .. } => "partitions",
            Self::Items { .. } => "items",
        }
    }
}

/// Errors returned by the work queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An enqueue would violate a partition-count or per-partition bound
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(CapacityLimit),

    /// Commit or rollback named a key without an open reservation
    #[error("No open reservation for partition {key}")]
    InvalidReservation { key: String },

    /// The store could not be reached or failed the request
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Concurrent modifications defeated every commit attempt
    #[error("Store contention: gave up after {attempts} attempts")]
    StoreContention { attempts: u32 },

    /// Item could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Score cannot be placed on the timeline
    #[error("Invalid score: {0}")]
    InvalidScore(f64),
}

impl QueueError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded(_) | Self::StoreUnavailable(_) | Self::StoreContention { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
