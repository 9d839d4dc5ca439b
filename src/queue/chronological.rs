//! Time-indexed queue with windowed batch extraction

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{QueueError, Result, StoreError};
use crate::metrics::QueueMetrics;
use crate::store::{OpReply, StoreOp, WorkQueueStore};

use super::models::{decode_item, encode_item, TimelineEntry};

const QUEUE_KIND: &str = "chronological";

/// Zero-padded sequence number plus `:` in front of each timeline member.
/// Members with equal scores sort by it, so ties keep insertion order.
const SEQUENCE_PREFIX_LEN: usize = 21;

/// Records scored by a time value, extracted in ascending order from a
/// `[min, max]` window. Removal is final; there is no reservation.
pub struct ChronologicalWorkQueue<T> {
    store: Arc<dyn WorkQueueStore>,
    timeline_key: String,
    sequence_key: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> ChronologicalWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn WorkQueueStore>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            store,
            timeline_key: format!("{}:timeline", namespace),
            sequence_key: format!("{}:sequence", namespace),
            _item: PhantomData,
        }
    }

    /// Insert `item` for `key` at `score`. NaN scores are rejected.
    pub async fn enqueue(&self, key: &str, item: &T, score: f64) -> Result<()> {
        if score.is_nan() {
            return Err(QueueError::InvalidScore(score));
        }

        let payload = encode_item(&TimelineEntry {
            key: key.to_string(),
            item,
        })?;

        let sequence = match self
            .store
            .apply(StoreOp::Incr {
                key: self.sequence_key.clone(),
            })
            .await?
        {
            OpReply::Count(n) => n,
            other => {
                return Err(StoreError::Protocol(format!(
                    "sequence increment replied {:?}",
                    other
                ))
                .into())
            }
        };

        let mut member = format!("{:020}:", sequence).into_bytes();
        member.extend_from_slice(&payload);

        self.store
            .apply(StoreOp::SortedInsert {
                key: self.timeline_key.clone(),
                score,
                member,
            })
            .await?;

        QueueMetrics::record_enqueued(QUEUE_KIND, 1);
        tracing::debug!(key = %key, score, sequence, "Scheduled record");
        Ok(())
    }

    /// Remove and return up to `max_count` records scored in
    /// `[min_score, max_score]`, earliest first.
    pub async fn dequeue(
        &self,
        min_score: f64,
        max_score: f64,
        max_count: usize,
    ) -> Result<Vec<(String, T)>> {
        if max_count == 0 || min_score.is_nan() || max_score.is_nan() || min_score > max_score {
            return Ok(Vec::new());
        }

        let members = self
            .store
            .apply(StoreOp::SortedPopRange {
                key: self.timeline_key.clone(),
                min: min_score,
                max: max_score,
                count: max_count,
            })
            .await?
            .into_values();

        let records = members
            .iter()
            .map(|member| -> Result<(String, T)> {
                let payload = member.get(SEQUENCE_PREFIX_LEN..).ok_or_else(|| {
                    StoreError::Protocol("timeline member is missing its sequence".to_string())
                })?;
                let entry: TimelineEntry<T> = decode_item(payload)?;
                Ok((entry.key, entry.item))
            })
            .collect::<Result<Vec<_>>>()?;

        if !records.is_empty() {
            QueueMetrics::record_dequeued(QUEUE_KIND, records.len());
            tracing::debug!(
                min_score,
                max_score,
                count = records.len(),
                "Dequeued timeline window"
            );
        }
        Ok(records)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.sorted_len(&self.timeline_key).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
