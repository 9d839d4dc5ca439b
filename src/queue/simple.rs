//! Unpartitioned FIFO queue

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::metrics::QueueMetrics;
use crate::store::{ListEnd, StoreOp, WorkQueueStore};

use super::models::{decode_item, encode_item};

const QUEUE_KIND: &str = "simple";

/// Single FIFO list with batch dequeue and rollback.
///
/// Every operation is one store primitive, so no guards or retries are
/// involved.
pub struct SimpleWorkQueue<T> {
    store: Arc<dyn WorkQueueStore>,
    items_key: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> SimpleWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn WorkQueueStore>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            store,
            items_key: format!("{}:items", namespace),
            _item: PhantomData,
        }
    }

    /// Append an item at the tail.
    pub async fn enqueue(&self, item: &T) -> Result<()> {
        let value = encode_item(item)?;
        self.store
            .apply(StoreOp::push(&self.items_key, ListEnd::Tail, value))
            .await?;
        QueueMetrics::record_enqueued(QUEUE_KIND, 1);
        Ok(())
    }

    /// Remove up to `max_count` items from the head, oldest first.
    pub async fn dequeue(&self, max_count: usize) -> Result<Vec<T>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let values = self
            .store
            .apply(StoreOp::ListPop {
                key: self.items_key.clone(),
                end: ListEnd::Head,
                count: max_count,
            })
            .await?
            .into_values();

        let items = values
            .iter()
            .map(|v| decode_item(v))
            .collect::<Result<Vec<T>>>()?;

        if !items.is_empty() {
            QueueMetrics::record_dequeued(QUEUE_KIND, items.len());
            tracing::debug!(queue = %self.items_key, count = items.len(), "Dequeued items");
        }
        Ok(items)
    }

    /// Reinsert `items` at the head, keeping their relative order.
    pub async fn push_front(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let values = items.iter().map(encode_item).collect::<Result<Vec<_>>>()?;
        self.store
            .apply(StoreOp::ListPush {
                key: self.items_key.clone(),
                end: ListEnd::Head,
                values,
            })
            .await?;

        QueueMetrics::record_restored(QUEUE_KIND, items.len());
        tracing::debug!(queue = %self.items_key, count = items.len(), "Restored items to head");
        Ok(())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.list_len(&self.items_key).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
