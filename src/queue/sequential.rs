//! Partitioned queue with per-key ordering, exclusivity and fair rotation.
//!
//! # Store layout
//!
//! For namespace `ns`:
//!
//! - `ns:partition:{key}`: list of pending items for `key`
//! - `ns:rotation`: list of keys ready to be served, each at most once
//! - `ns:partitions`: set of tracked keys (pending items or open reservation)
//! - `ns:reservation:{key}`: list holding the in-flight batch of `key`.
//!   It exists exactly while the key is reserved.
//! - `ns:leases`: sorted set of reserved keys scored by reservation time (ms)
//!
//! A key is in the rotation iff its record is non-empty and it is not
//! reserved. Every multi-key change is one guarded commit.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CapacityLimit, QueueError, Result};
use crate::metrics::{QueueMetrics, ReservationMetrics};
use crate::redis::current_time_ms;
use crate::store::{Guard, ListEnd, StoreOp, WorkQueueStore};

use super::models::{
    decode_item, decode_key, encode_item, Batch, SequentialConfig, SequentialQueueStats,
};
use super::retry::CommitRetry;

const QUEUE_KIND: &str = "sequential";

struct SequentialKeys {
    prefix: String,
    rotation: String,
    partitions: String,
    leases: String,
}

impl SequentialKeys {
    fn new(namespace: String) -> Self {
        Self {
            rotation: format!("{}:rotation", namespace),
            partitions: format!("{}:partitions", namespace),
            leases: format!("{}:leases", namespace),
            prefix: namespace,
        }
    }

    fn record(&self, key: &str) -> String {
        format!("{}:partition:{}", self.prefix, key)
    }

    fn reservation(&self, key: &str) -> String {
        format!("{}:reservation:{}", self.prefix, key)
    }
}

/// How an open reservation is closed.
enum Resolution {
    Commit,
    Rollback(Vec<Vec<u8>>),
    /// Roll back the stored batch if the lease is older than the cutoff
    Reclaim { cutoff_ms: i64 },
}

impl Resolution {
    fn operation(&self) -> &'static str {
        match self {
            Resolution::Commit => "post_dequeue",
            Resolution::Rollback(_) => "push_front",
            Resolution::Reclaim { .. } => "reclaim",
        }
    }
}

/// Many per-key FIFOs multiplexed through a round-robin rotation.
///
/// A consumer takes a batch from the key at the rotation head and holds a
/// reservation on that key until it calls [`post_dequeue`] (done) or
/// [`push_front`] (give the batch back). While reserved, the key is never
/// handed to another consumer.
///
/// [`post_dequeue`]: SequentialWorkQueue::post_dequeue
/// [`push_front`]: SequentialWorkQueue::push_front
pub struct SequentialWorkQueue<T> {
    store: Arc<dyn WorkQueueStore>,
    keys: SequentialKeys,
    config: SequentialConfig,
    _item: PhantomData<fn() -> T>,
}

impl<T> SequentialWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(
        store: Arc<dyn WorkQueueStore>,
        namespace: impl Into<String>,
        config: SequentialConfig,
    ) -> Self {
        Self {
            store,
            keys: SequentialKeys::new(namespace.into()),
            config,
            _item: PhantomData,
        }
    }

    pub fn config(&self) -> &SequentialConfig {
        &self.config
    }

    /// Append `item` to the record of `key`.
    ///
    /// Fails with `CapacityExceeded` when `key` is new and the partition
    /// limit is reached, or when the record is already full.
    pub async fn enqueue(&self, key: &str, item: &T) -> Result<()> {
        let value = encode_item(item)?;
        let record_key = self.keys.record(key);
        let reservation_key = self.keys.reservation(key);
        let mut retry = CommitRetry::new("enqueue", &self.config.retry);

        loop {
            let mut guards = self
                .store
                .guards(&[
                    record_key.clone(),
                    reservation_key.clone(),
                    self.keys.partitions.clone(),
                ])
                .await?;

            let tracked = self.store.set_contains(&self.keys.partitions, key).await?;
            let record_len = self.store.list_len(&record_key).await?;
            let reserved = self.store.list_len(&reservation_key).await? > 0;

            if !tracked
                && self.store.set_len(&self.keys.partitions).await? >= self.config.max_partitions
            {
                return Err(self.reject(CapacityLimit::Partitions {
                    max: self.config.max_partitions,
                }));
            }
            if record_len >= self.config.max_items_per_partition {
                return Err(self.reject(CapacityLimit::Items {
                    key: key.to_string(),
                    max: self.config.max_items_per_partition,
                }));
            }

            let mut ops = Vec::with_capacity(3);
            if tracked {
                // Untracking this key always touches its record or reservation
                guards.truncate(2);
            } else {
                ops.push(StoreOp::SetAdd {
                    key: self.keys.partitions.clone(),
                    member: key.to_string(),
                });
            }
            ops.push(StoreOp::push(&record_key, ListEnd::Tail, value.clone()));
            if record_len == 0 && !reserved {
                ops.push(StoreOp::push(
                    &self.keys.rotation,
                    ListEnd::Tail,
                    key.as_bytes().to_vec(),
                ));
            }

            if self.store.commit(&guards, ops).await?.is_some() {
                QueueMetrics::record_enqueued(QUEUE_KIND, 1);
                tracing::debug!(key = %key, new_partition = !tracked, "Enqueued item");
                return Ok(());
            }
            retry.conflict().await?;
        }
    }

    /// Reserve the key at the rotation head and take up to `max_count` of
    /// its items.
    ///
    /// Returns [`Batch::empty`] when no key is ready or `max_count` is 0.
    pub async fn dequeue(&self, max_count: usize) -> Result<Batch<T>> {
        if max_count == 0 {
            return Ok(Batch::empty());
        }
        let mut retry = CommitRetry::new("dequeue", &self.config.retry);

        loop {
            let mut guards = self.store.guards(&[self.keys.rotation.clone()]).await?;
            let Some(head) = self
                .store
                .list_range(&self.keys.rotation, 0, 1)
                .await?
                .pop()
            else {
                return Ok(Batch::empty());
            };
            let key = decode_key(head.clone())?;
            let record_key = self.keys.record(&key);
            let reservation_key = self.keys.reservation(&key);

            guards.extend(
                self.store
                    .guards(&[record_key.clone(), reservation_key.clone()])
                    .await?,
            );
            let values = self.store.list_range(&record_key, 0, max_count).await?;
            let reserved = self.store.list_len(&reservation_key).await? > 0;

            if values.is_empty() || reserved {
                if !self.drop_stale_head(&key, &guards, reserved).await? {
                    retry.conflict().await?;
                }
                continue;
            }

            let items = match values.iter().map(|v| decode_item(v)).collect::<Result<Vec<T>>>() {
                Ok(items) => items,
                Err(e) => {
                    self.rotate_past(&key, &head, &guards).await?;
                    return Err(e);
                }
            };

            let ops = vec![
                StoreOp::ListPop {
                    key: self.keys.rotation.clone(),
                    end: ListEnd::Head,
                    count: 1,
                },
                StoreOp::ListPop {
                    key: record_key,
                    end: ListEnd::Head,
                    count: values.len(),
                },
                StoreOp::ListPush {
                    key: reservation_key,
                    end: ListEnd::Tail,
                    values,
                },
                StoreOp::SortedInsert {
                    key: self.keys.leases.clone(),
                    score: current_time_ms() as f64,
                    member: head,
                },
            ];

            if self.store.commit(&guards, ops).await?.is_some() {
                QueueMetrics::record_dequeued(QUEUE_KIND, items.len());
                ReservationMetrics::record_opened();
                tracing::debug!(key = %key, count = items.len(), "Reserved partition batch");
                return Ok(Batch {
                    key: Some(key),
                    items,
                });
            }
            retry.conflict().await?;
        }
    }

    /// Commit the open reservation of `key`.
    ///
    /// The key goes to the rotation tail if it still has items, otherwise it
    /// stops being tracked.
    pub async fn post_dequeue(&self, key: &str) -> Result<()> {
        self.resolve(key, Resolution::Commit).await?;
        ReservationMetrics::record_committed();
        tracing::debug!(key = %key, "Committed reservation");
        Ok(())
    }

    /// Roll back the open reservation of `key`, putting `items` back ahead
    /// of anything enqueued since and the key at the rotation head.
    ///
    /// Without an open reservation (for instance after `post_dequeue`), the
    /// items are still restored the same way and the key is tracked again.
    /// Never refused for capacity.
    pub async fn push_front(&self, key: &str, items: &[T]) -> Result<()> {
        let values = items.iter().map(encode_item).collect::<Result<Vec<_>>>()?;
        self.resolve(key, Resolution::Rollback(values)).await?;
        ReservationMetrics::record_rolled_back();
        if !items.is_empty() {
            QueueMetrics::record_restored(QUEUE_KIND, items.len());
        }
        tracing::debug!(key = %key, count = items.len(), "Rolled back reservation");
        Ok(())
    }

    /// Roll back every reservation opened more than `lease` ago, restoring
    /// the batch it was opened with. Returns the reclaimed keys.
    pub async fn reclaim_expired(&self, lease: Duration) -> Result<Vec<String>> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let cutoff_ms = current_time_ms().saturating_sub(lease_ms);
        let expired = self
            .store
            .sorted_range_by_score(&self.keys.leases, f64::NEG_INFINITY, cutoff_ms as f64)
            .await?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for member in expired {
            let key = decode_key(member)?;
            match self.resolve(&key, Resolution::Reclaim { cutoff_ms }).await {
                Ok(Some(count)) => {
                    QueueMetrics::record_restored(QUEUE_KIND, count);
                    tracing::info!(key = %key, restored = count, "Reclaimed expired reservation");
                    reclaimed.push(key);
                }
                Ok(None) | Err(QueueError::InvalidReservation { .. }) => {
                    tracing::debug!(key = %key, "Reservation resolved before reclaim");
                }
                Err(e) => return Err(e),
            }
        }

        ReservationMetrics::record_reclaimed(reclaimed.len());
        Ok(reclaimed)
    }

    /// Items waiting in the record of `key`, excluding any in-flight batch.
    pub async fn pending(&self, key: &str) -> Result<usize> {
        Ok(self.store.list_len(&self.keys.record(key)).await?)
    }

    pub async fn stats(&self) -> Result<SequentialQueueStats> {
        Ok(SequentialQueueStats {
            backend_type: self.store.backend_type().to_string(),
            ready_partitions: self.store.list_len(&self.keys.rotation).await?,
            tracked_partitions: self.store.set_len(&self.keys.partitions).await?,
            open_reservations: self.store.sorted_len(&self.keys.leases).await?,
            max_partitions: self.config.max_partitions,
            max_items_per_partition: self.config.max_items_per_partition,
        })
    }

    fn reject(&self, limit: CapacityLimit) -> QueueError {
        QueueMetrics::record_capacity_rejection(limit.as_str());
        tracing::debug!(limit = %limit, "Enqueue rejected");
        QueueError::CapacityExceeded(limit)
    }

    /// Remove a rotation head that cannot be served: its record is empty or
    /// it is already reserved. Returns whether the repair was committed.
    async fn drop_stale_head(&self, key: &str, guards: &[Guard], reserved: bool) -> Result<bool> {
        tracing::warn!(key = %key, reserved, "Dropping unservable key from rotation head");

        let mut ops = vec![StoreOp::ListPop {
            key: self.keys.rotation.clone(),
            end: ListEnd::Head,
            count: 1,
        }];
        if !reserved {
            ops.push(self.untrack(key));
        }
        Ok(self.store.commit(guards, ops).await?.is_some())
    }

    /// Move a head key whose items cannot be decoded to the rotation tail,
    /// so the keys behind it keep being served.
    async fn rotate_past(&self, key: &str, head: &[u8], guards: &[Guard]) -> Result<()> {
        let ops = vec![
            StoreOp::ListPop {
                key: self.keys.rotation.clone(),
                end: ListEnd::Head,
                count: 1,
            },
            StoreOp::push(&self.keys.rotation, ListEnd::Tail, head.to_vec()),
        ];
        let moved = self.store.commit(guards, ops).await?.is_some();
        tracing::warn!(key = %key, moved, "Undecodable items at rotation head, key moved to tail");
        Ok(())
    }

    /// Close the reservation of `key`. Returns the number of items put back
    /// into the record, or `None` when a reclaim found the lease renewed.
    ///
    /// A rollback on a key without an open reservation still restores its
    /// items, ahead of the record and with the key at the rotation head.
    async fn resolve(&self, key: &str, resolution: Resolution) -> Result<Option<usize>> {
        let record_key = self.keys.record(key);
        let reservation_key = self.keys.reservation(key);
        let mut retry = CommitRetry::new(resolution.operation(), &self.config.retry);

        loop {
            let guards = self
                .store
                .guards(&[reservation_key.clone(), record_key.clone()])
                .await?;

            let reserved_len = self.store.list_len(&reservation_key).await?;
            let (ops, restored) = if reserved_len > 0 {
                let record_len = self.store.list_len(&record_key).await?;
                match self
                    .close_reservation(key, &resolution, reserved_len, record_len)
                    .await?
                {
                    Some(closed) => closed,
                    None => return Ok(None),
                }
            } else {
                match &resolution {
                    Resolution::Rollback(values) if values.is_empty() => return Ok(Some(0)),
                    Resolution::Rollback(values) => {
                        tracing::debug!(key = %key, "Restoring batch without open reservation");
                        (self.restore_ops(key, values.clone(), true), values.len())
                    }
                    _ => {
                        return Err(QueueError::InvalidReservation {
                            key: key.to_string(),
                        })
                    }
                }
            };

            if self.store.commit(&guards, ops).await?.is_some() {
                return Ok(Some(restored));
            }
            retry.conflict().await?;
        }
    }

    /// Ops that drop the open reservation of `key` and restore or discard its
    /// batch, with the number of restored items. `None` when a reclaim finds
    /// the lease renewed.
    async fn close_reservation(
        &self,
        key: &str,
        resolution: &Resolution,
        reserved_len: usize,
        record_len: usize,
    ) -> Result<Option<(Vec<StoreOp>, usize)>> {
        let restored = match resolution {
            Resolution::Commit => Vec::new(),
            Resolution::Rollback(values) => values.clone(),
            Resolution::Reclaim { cutoff_ms } => {
                let still_expired = self
                    .store
                    .sorted_range_by_score(&self.keys.leases, f64::NEG_INFINITY, *cutoff_ms as f64)
                    .await?
                    .iter()
                    .any(|m| m.as_slice() == key.as_bytes());
                if !still_expired {
                    return Ok(None);
                }
                self.store
                    .list_range(&self.keys.reservation(key), 0, reserved_len)
                    .await?
            }
        };

        let restored_len = restored.len();
        let mut ops = vec![
            StoreOp::Delete {
                key: self.keys.reservation(key),
            },
            StoreOp::SortedRemove {
                key: self.keys.leases.clone(),
                member: key.as_bytes().to_vec(),
            },
        ];
        match resolution {
            Resolution::Commit if record_len > 0 => ops.push(StoreOp::push(
                &self.keys.rotation,
                ListEnd::Tail,
                key.as_bytes().to_vec(),
            )),
            Resolution::Commit => ops.push(self.untrack(key)),
            _ if record_len + restored_len > 0 => {
                ops.extend(self.restore_ops(key, restored, false))
            }
            _ => ops.push(self.untrack(key)),
        }
        Ok(Some((ops, restored_len)))
    }

    /// Put `values` at the head of the record of `key` and the key at the
    /// rotation head. An unreserved key may already sit in the rotation, so
    /// `reposition` removes that entry first.
    fn restore_ops(&self, key: &str, values: Vec<Vec<u8>>, reposition: bool) -> Vec<StoreOp> {
        let member = key.as_bytes().to_vec();
        let mut ops = Vec::with_capacity(4);
        if !values.is_empty() {
            ops.push(StoreOp::ListPush {
                key: self.keys.record(key),
                end: ListEnd::Head,
                values,
            });
        }
        if reposition {
            ops.push(StoreOp::ListRemove {
                key: self.keys.rotation.clone(),
                value: member.clone(),
            });
            ops.push(StoreOp::SetAdd {
                key: self.keys.partitions.clone(),
                member: key.to_string(),
            });
        }
        ops.push(StoreOp::push(&self.keys.rotation, ListEnd::Head, member));
        ops
    }

    fn untrack(&self, key: &str) -> StoreOp {
        StoreOp::SetRemove {
            key: self.keys.partitions.clone(),
            member: key.to_string(),
        }
    }
}
