//! Many consumers sharing one store
//!
//! Checks that no item is delivered twice, that a key is never held by two
//! consumers at once, and that per-key order survives concurrent dequeues.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;

use redis_workqueue::queue::{
    ChronologicalWorkQueue, RetryConfig, SequentialConfig, SequentialWorkQueue, SimpleWorkQueue,
};
use redis_workqueue::redis::BackoffConfig;
use redis_workqueue::store::{MemoryStore, WorkQueueStore};

const CONSUMERS: usize = 8;

fn patient_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 256,
        backoff: BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 10,
            multiplier: 2.0,
            jitter_factor: 0.5,
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_exclusivity_and_order() {
    const KEYS: usize = 8;
    const ITEMS_PER_KEY: usize = 10;

    let store: Arc<dyn WorkQueueStore> = Arc::new(MemoryStore::new());
    let queue: Arc<SequentialWorkQueue<(usize, usize)>> = Arc::new(SequentialWorkQueue::new(
        store,
        "concurrent:sequential",
        SequentialConfig {
            max_partitions: KEYS,
            max_items_per_partition: ITEMS_PER_KEY,
            retry: patient_retry(),
        },
    ));

    for seq in 0..ITEMS_PER_KEY {
        for key in 0..KEYS {
            queue.enqueue(&format!("key{}", key), &(key, seq)).await.unwrap();
        }
    }

    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let delivered = Arc::new(Mutex::new(HashMap::<String, Vec<usize>>::new()));
    let remaining = Arc::new(AtomicUsize::new(KEYS * ITEMS_PER_KEY));

    let consumers = (0..CONSUMERS).map(|consumer| {
        let queue = queue.clone();
        let in_flight = in_flight.clone();
        let delivered = delivered.clone();
        let remaining = remaining.clone();
        tokio::spawn(async move {
            while remaining.load(Ordering::SeqCst) > 0 {
                let batch = queue.dequeue(1 + consumer % 3).await.unwrap();
                let Some(key) = batch.key else {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                };

                assert!(
                    in_flight.lock().unwrap().insert(key.clone()),
                    "{} handed to two consumers",
                    key
                );
                tokio::task::yield_now().await;

                // Every fourth batch fails downstream and is rolled back
                if batch.items[0].1 % 4 == 3 && consumer % 2 == 0 {
                    in_flight.lock().unwrap().remove(&key);
                    queue.push_front(&key, &batch.items).await.unwrap();
                    continue;
                }

                {
                    let mut delivered = delivered.lock().unwrap();
                    let seen = delivered.entry(key.clone()).or_default();
                    seen.extend(batch.items.iter().map(|(_, seq)| *seq));
                }
                remaining.fetch_sub(batch.items.len(), Ordering::SeqCst);
                in_flight.lock().unwrap().remove(&key);
                queue.post_dequeue(&key).await.unwrap();
            }
        })
    });

    for result in join_all(consumers).await {
        result.unwrap();
    }

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), KEYS);
    for seqs in delivered.values() {
        assert_eq!(*seqs, (0..ITEMS_PER_KEY).collect::<Vec<_>>());
    }

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.tracked_partitions, 0);
    assert_eq!(stats.ready_partitions, 0);
    assert_eq!(stats.open_reservations, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueue_respects_partition_limit() {
    let store: Arc<dyn WorkQueueStore> = Arc::new(MemoryStore::new());
    let queue: Arc<SequentialWorkQueue<u32>> = Arc::new(SequentialWorkQueue::new(
        store,
        "concurrent:capacity",
        SequentialConfig {
            max_partitions: 5,
            max_items_per_partition: 10,
            retry: patient_retry(),
        },
    ));

    let producers = (0..20).map(|i| {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue(&format!("key{}", i), &(i as u32)).await })
    });

    let accepted = join_all(producers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.is_ok())
        .count();

    assert_eq!(accepted, 5);
    assert_eq!(queue.stats().await.unwrap().tracked_partitions, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simple_items_delivered_once() {
    let store: Arc<dyn WorkQueueStore> = Arc::new(MemoryStore::new());
    let queue: Arc<SimpleWorkQueue<u32>> =
        Arc::new(SimpleWorkQueue::new(store, "concurrent:simple"));
    for i in 0..200 {
        queue.enqueue(&i).await.unwrap();
    }

    let consumers = (0..CONSUMERS).map(|_| {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut got = Vec::new();
            loop {
                let batch = queue.dequeue(7).await.unwrap();
                if batch.is_empty() {
                    break got;
                }
                // Each batch is a contiguous, ordered slice
                assert!(batch.windows(2).all(|w| w[1] == w[0] + 1));
                got.extend(batch);
            }
        })
    });

    let mut all: Vec<u32> = join_all(consumers)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..200).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chronological_records_delivered_once() {
    let store: Arc<dyn WorkQueueStore> = Arc::new(MemoryStore::new());
    let queue: Arc<ChronologicalWorkQueue<u32>> =
        Arc::new(ChronologicalWorkQueue::new(store, "concurrent:chronological"));

    let producers = (0..100u32).map(|i| {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue("k", &i, f64::from(i % 10)).await })
    });
    for result in join_all(producers).await {
        result.unwrap().unwrap();
    }
    assert_eq!(queue.len().await.unwrap(), 100);

    let consumers = (0..CONSUMERS).map(|_| {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut got = Vec::new();
            loop {
                let batch = queue.dequeue(0.0, 9.0, 5).await.unwrap();
                if batch.is_empty() {
                    break got;
                }
                got.extend(batch.into_iter().map(|(_, item)| item));
            }
        })
    });

    let mut all: Vec<u32> = join_all(consumers)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..100).collect::<Vec<_>>());
}
