//! Queue data models and configuration

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::QueueSettings;
use crate::error::{QueueError, StoreError};
use crate::redis::BackoffConfig;

/// Batch handed out by [`SequentialWorkQueue::dequeue`](super::SequentialWorkQueue::dequeue).
///
/// `key` is `None` (and `items` empty) when no partition was ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub key: Option<String>,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    pub fn empty() -> Self {
        Self {
            key: None,
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Retry budget for optimistic commits
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Commit attempts before giving up with `StoreContention`
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for RetryConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            max_attempts: settings.max_commit_attempts.max(1),
            backoff: BackoffConfig::for_commit_retry(settings),
        }
    }
}

/// Configuration for a sequential (partitioned) queue
#[derive(Debug, Clone)]
pub struct SequentialConfig {
    /// Maximum number of distinct partition keys tracked at once
    pub max_partitions: usize,
    /// Maximum number of pending items per partition
    pub max_items_per_partition: usize,
    pub retry: RetryConfig,
}

impl Default for SequentialConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for SequentialConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            max_partitions: settings.max_partitions,
            max_items_per_partition: settings.max_items_per_partition,
            retry: RetryConfig::from(settings),
        }
    }
}

/// Statistics about a sequential queue
#[derive(Debug, Clone, Serialize)]
pub struct SequentialQueueStats {
    pub backend_type: String,
    /// Partitions waiting to be served
    pub ready_partitions: usize,
    /// Partitions with pending items or an open reservation
    pub tracked_partitions: usize,
    pub open_reservations: usize,
    pub max_partitions: usize,
    pub max_items_per_partition: usize,
}

/// Timeline member payload of the chronological queue
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TimelineEntry<T> {
    pub key: String,
    pub item: T,
}

pub(crate) fn encode_item<T: Serialize>(item: &T) -> Result<Vec<u8>, QueueError> {
    Ok(serde_json::to_vec(item)?)
}

pub(crate) fn decode_item<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, QueueError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub(crate) fn decode_key(bytes: Vec<u8>) -> Result<String, QueueError> {
    String::from_utf8(bytes).map_err(|_| {
        QueueError::StoreUnavailable(StoreError::Protocol(
            "partition key is not valid UTF-8".to_string(),
        ))
    })
}
