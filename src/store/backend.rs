//! Backend trait for the shared work queue store.
//!
//! The queues never assume a backend keeps several structures consistent
//! with each other. They read what they need, then submit a batch of writes
//! guarded by the versions of the keys they read. The backend applies the
//! whole batch atomically, or nothing if any guarded key was written in the
//! meantime.
//!
//! # Versions
//!
//! Versions are stamps drawn from one store-wide clock. A key that holds
//! data carries the stamp of its last change. A key without data carries
//! the stamp of its tombstone bucket, which advances whenever any key in
//! that bucket is emptied. Bookkeeping is therefore bounded by the live
//! keys plus [`TOMBSTONE_BUCKETS`], and a key that is created and drained
//! between a guard and its commit still invalidates the guard.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::redis::RedisHealthSnapshot;

/// Number of tombstone buckets shared by all data-less keys.
pub const TOMBSTONE_BUCKETS: u32 = 1024;

/// Tombstone bucket of `key`. The Redis commit script computes the same
/// function, so both must change together.
pub fn tombstone_bucket(key: &str) -> u32 {
    key.bytes()
        .fold(0, |h, b| (h * 31 + u32::from(b)) % TOMBSTONE_BUCKETS)
}

/// Which end of a list an operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Head,
    Tail,
}

impl ListEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListEnd::Head => "head",
            ListEnd::Tail => "tail",
        }
    }
}

/// A single write applied inside [`WorkQueueStore::commit`].
///
/// Every op that changes its key gives that key a new version.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Insert `values` at one end. At the head the values keep their
    /// relative order, so `values[0]` becomes the new first element.
    ListPush {
        key: String,
        end: ListEnd,
        values: Vec<Vec<u8>>,
    },
    /// Remove up to `count` values from one end. Replies with the removed
    /// values in list order.
    ListPop {
        key: String,
        end: ListEnd,
        count: usize,
    },
    /// Remove every occurrence of `value`.
    ListRemove {
        key: String,
        value: Vec<u8>,
    },
    /// Insert or re-score `member`. Equal scores are ordered by member bytes.
    SortedInsert {
        key: String,
        score: f64,
        member: Vec<u8>,
    },
    /// Remove up to `count` members scored in `[min, max]`. Replies with the
    /// removed members, lowest score first.
    SortedPopRange {
        key: String,
        min: f64,
        max: f64,
        count: usize,
    },
    SortedRemove {
        key: String,
        member: Vec<u8>,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    Delete {
        key: String,
    },
    /// Increment a counter. Replies with the new value.
    Incr {
        key: String,
    },
}

impl StoreOp {
    pub fn key(&self) -> &str {
        match self {
            StoreOp::ListPush { key, .. }
            | StoreOp::ListPop { key, .. }
            | StoreOp::ListRemove { key, .. }
            | StoreOp::SortedInsert { key, .. }
            | StoreOp::SortedPopRange { key, .. }
            | StoreOp::SortedRemove { key, .. }
            | StoreOp::SetAdd { key, .. }
            | StoreOp::SetRemove { key, .. }
            | StoreOp::Delete { key }
            | StoreOp::Incr { key } => key,
        }
    }

    /// Convenience for pushing a single value.
    pub fn push(key: impl Into<String>, end: ListEnd, value: Vec<u8>) -> Self {
        StoreOp::ListPush {
            key: key.into(),
            end,
            values: vec![value],
        }
    }
}

/// Per-op reply of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpReply {
    Done,
    Values(Vec<Vec<u8>>),
    Count(i64),
}

impl OpReply {
    pub fn into_values(self) -> Vec<Vec<u8>> {
        match self {
            OpReply::Values(values) => values,
            _ => Vec::new(),
        }
    }
}

/// Version of a key observed before reading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub key: String,
    pub version: u64,
}

/// Shared store the work queues are built on.
///
/// # Thread Safety
///
/// Implementations are shared across tasks (and, for Redis, processes)
/// behind an `Arc`, so they must be `Send + Sync`.
///
/// # Consistency
///
/// Reads are individually atomic but not mutually consistent. Callers that
/// need consistency fetch [`guards`](WorkQueueStore::guards) *before* reading
/// and pass them to [`commit`](WorkQueueStore::commit).
#[async_trait]
pub trait WorkQueueStore: Send + Sync {
    /// Backend type identifier
    fn backend_type(&self) -> &'static str;

    /// Whether the backend can currently serve requests
    fn is_healthy(&self) -> bool {
        true
    }

    /// Connection status for backends that hold one
    fn connection_health(&self) -> Option<RedisHealthSnapshot> {
        None
    }

    /// Current versions of `keys`, in order. Keys that never held data in
    /// a fresh bucket are version 0.
    async fn guards(&self, keys: &[String]) -> Result<Vec<Guard>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Up to `count` values starting at index `start`.
    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_len(&self, key: &str) -> Result<usize, StoreError>;

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Members scored in `[min, max]`, lowest first, without removing them.
    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Apply `ops` atomically if every guard still holds.
    ///
    /// Returns `None`, with nothing applied, when a guarded key has been
    /// written since its guard was taken.
    async fn commit(
        &self,
        guards: &[Guard],
        ops: Vec<StoreOp>,
    ) -> Result<Option<Vec<OpReply>>, StoreError>;

    /// Apply a single op with no guards.
    async fn apply(&self, op: StoreOp) -> Result<OpReply, StoreError> {
        let mut replies = self
            .commit(&[], vec![op])
            .await?
            .ok_or_else(|| StoreError::Protocol("unguarded commit was rejected".to_string()))?;
        replies
            .pop()
            .ok_or_else(|| StoreError::Protocol("commit returned no reply".to_string()))
    }
}
