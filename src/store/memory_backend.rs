//! In-memory store backend.
//!
//! Keeps every structure behind one lock so a commit is trivially atomic.
//! State is lost on restart; intended for tests and single-process use.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::metrics::StoreMetrics;

use super::backend::{tombstone_bucket, Guard, ListEnd, OpReply, StoreOp, WorkQueueStore};

#[derive(Debug, Clone)]
struct SortedEntry {
    score: f64,
    member: Vec<u8>,
}

impl SortedEntry {
    fn cmp_position(&self, score: f64, member: &[u8]) -> std::cmp::Ordering {
        self.score
            .total_cmp(&score)
            .then_with(|| self.member.as_slice().cmp(member))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    sets: HashMap<String, HashSet<String>>,
    /// Kept sorted by (score, member)
    sorted: HashMap<String, Vec<SortedEntry>>,
    counters: HashMap<String, i64>,
    /// Store-wide version clock
    clock: u64,
    /// Versions of keys currently holding data
    versions: HashMap<String, u64>,
    tombstones: HashMap<u32, u64>,
}

impl MemoryState {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or_else(|| {
            self.tombstones
                .get(&tombstone_bucket(key))
                .copied()
                .unwrap_or(0)
        })
    }

    fn holds(&self, key: &str) -> bool {
        self.lists.contains_key(key)
            || self.sets.contains_key(key)
            || self.sorted.contains_key(key)
            || self.counters.contains_key(key)
    }

    fn bump(&mut self, key: &str) {
        self.clock += 1;
        if self.holds(key) {
            self.versions.insert(key.to_string(), self.clock);
        } else {
            self.versions.remove(key);
            self.tombstones.insert(tombstone_bucket(key), self.clock);
        }
    }

    /// Apply one op, returning its reply and whether it changed anything.
    fn apply(&mut self, op: StoreOp) -> (OpReply, bool) {
        match op {
            StoreOp::ListPush { key, end, values } => {
                if values.is_empty() {
                    return (OpReply::Done, false);
                }
                let list = self.lists.entry(key).or_default();
                match end {
                    ListEnd::Head => {
                        for value in values.into_iter().rev() {
                            list.push_front(value);
                        }
                    }
                    ListEnd::Tail => list.extend(values),
                }
                (OpReply::Done, true)
            }
            StoreOp::ListPop { key, end, count } => {
                let Some(list) = self.lists.get_mut(&key) else {
                    return (OpReply::Values(Vec::new()), false);
                };
                let take = count.min(list.len());
                let popped: Vec<Vec<u8>> = match end {
                    ListEnd::Head => list.drain(..take).collect(),
                    ListEnd::Tail => list.drain(list.len() - take..).collect(),
                };
                if list.is_empty() {
                    self.lists.remove(&key);
                }
                let changed = !popped.is_empty();
                (OpReply::Values(popped), changed)
            }
            StoreOp::ListRemove { key, value } => {
                let Some(list) = self.lists.get_mut(&key) else {
                    return (OpReply::Done, false);
                };
                let before = list.len();
                list.retain(|v| *v != value);
                let changed = list.len() != before;
                if list.is_empty() {
                    self.lists.remove(&key);
                }
                (OpReply::Done, changed)
            }
            StoreOp::SortedInsert { key, score, member } => {
                let entries = self.sorted.entry(key).or_default();
                entries.retain(|e| e.member != member);
                let at = entries.partition_point(|e| e.cmp_position(score, &member).is_lt());
                entries.insert(at, SortedEntry { score, member });
                (OpReply::Done, true)
            }
            StoreOp::SortedPopRange {
                key,
                min,
                max,
                count,
            } => {
                let Some(entries) = self.sorted.get_mut(&key) else {
                    return (OpReply::Values(Vec::new()), false);
                };
                let start = entries.partition_point(|e| e.score < min);
                let end = entries.partition_point(|e| e.score <= max).max(start);
                let stop = (start + count).min(end);
                let popped: Vec<Vec<u8>> =
                    entries.drain(start..stop).map(|e| e.member).collect();
                if entries.is_empty() {
                    self.sorted.remove(&key);
                }
                let changed = !popped.is_empty();
                (OpReply::Values(popped), changed)
            }
            StoreOp::SortedRemove { key, member } => {
                let Some(entries) = self.sorted.get_mut(&key) else {
                    return (OpReply::Done, false);
                };
                let before = entries.len();
                entries.retain(|e| e.member != member);
                let changed = entries.len() != before;
                if entries.is_empty() {
                    self.sorted.remove(&key);
                }
                (OpReply::Done, changed)
            }
            StoreOp::SetAdd { key, member } => {
                let changed = self.sets.entry(key).or_default().insert(member);
                (OpReply::Done, changed)
            }
            StoreOp::SetRemove { key, member } => {
                let Some(set) = self.sets.get_mut(&key) else {
                    return (OpReply::Done, false);
                };
                let changed = set.remove(&member);
                if set.is_empty() {
                    self.sets.remove(&key);
                }
                (OpReply::Done, changed)
            }
            StoreOp::Delete { key } => {
                let changed = self.lists.remove(&key).is_some()
                    | self.sets.remove(&key).is_some()
                    | self.sorted.remove(&key).is_some()
                    | self.counters.remove(&key).is_some();
                (OpReply::Done, changed)
            }
            StoreOp::Incr { key } => {
                let counter = self.counters.entry(key).or_insert(0);
                *counter += 1;
                (OpReply::Count(*counter), true)
            }
        }
    }
}

/// In-memory [`WorkQueueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueueStore for MemoryStore {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn guards(&self, keys: &[String]) -> Result<Vec<Guard>, StoreError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .map(|key| Guard {
                key: key.clone(),
                version: state.version(key),
            })
            .collect())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .lists
            .get(key)
            .map(|l| l.iter().skip(start).take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.contains(member))
            .unwrap_or(false))
    }

    async fn set_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sets.get(key).map(|s| s.len()).unwrap_or(0))
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted.get(key).map(|s| s.len()).unwrap_or(0))
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sorted
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.score >= min && e.score <= max)
                    .map(|e| e.member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        guards: &[Guard],
        ops: Vec<StoreOp>,
    ) -> Result<Option<Vec<OpReply>>, StoreError> {
        let started = Instant::now();
        let mut state = self.state.lock().await;

        if let Some(stale) = guards.iter().find(|g| state.version(&g.key) != g.version) {
            tracing::trace!(key = %stale.key, "Guarded commit rejected");
            return Ok(None);
        }

        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let key = op.key().to_string();
            let (reply, changed) = state.apply(op);
            if changed {
                state.bump(&key);
            }
            replies.push(reply);
        }

        StoreMetrics::observe_latency("memory", "commit", started.elapsed());
        Ok(Some(replies))
    }
}
