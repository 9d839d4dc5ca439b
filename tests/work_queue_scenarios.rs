//! End-to-end queue scenarios
//!
//! Run against `MemoryStore`. The Redis variants are ignored by default and
//! need a server at redis://localhost:6379.

use std::sync::Arc;

use redis_workqueue::config::{QueueSettings, RedisConfig, StoreConfig};
use redis_workqueue::queue::{
    ChronologicalWorkQueue, SequentialConfig, SequentialWorkQueue, SimpleWorkQueue,
};
use redis_workqueue::store::{MemoryStore, RedisStore, WorkQueueStore};
use redis_workqueue::QueueError;

const NUM_MESSAGES: usize = 6;

fn memory_store() -> Arc<dyn WorkQueueStore> {
    Arc::new(MemoryStore::new())
}

async fn redis_store() -> Arc<dyn WorkQueueStore> {
    let store = RedisStore::connect(
        &RedisConfig::default(),
        &StoreConfig {
            backend: "redis".to_string(),
            versions_key: "workqueue-it:versions".to_string(),
        },
        3,
    )
    .await
    .expect("Redis must be running for ignored tests");
    Arc::new(store)
}

/// Namespace that no earlier run has written to
fn fresh_namespace(kind: &str) -> String {
    format!(
        "workqueue-it:{}:{}",
        kind,
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

fn sequential_queue(store: Arc<dyn WorkQueueStore>, namespace: &str) -> SequentialWorkQueue<String> {
    SequentialWorkQueue::new(
        store,
        namespace,
        SequentialConfig::from(&QueueSettings::default()),
    )
}

async fn run_sequential_scenario(store: Arc<dyn WorkQueueStore>, namespace: &str) {
    let queue = sequential_queue(store, namespace);
    let patients = ["patient0", "patient1"];
    let mut messages0 = Vec::new();
    let mut messages1 = Vec::new();

    for i in 0..NUM_MESSAGES {
        messages0.push(format!("{}_message{}", patients[0], i));
        queue.enqueue(patients[0], &messages0[i]).await.unwrap();
        messages1.push(format!("{}_message{}", patients[1], i));
        queue.enqueue(patients[1], &messages1[i]).await.unwrap();
    }

    // First half of patient0
    let batch = queue.dequeue(NUM_MESSAGES / 2).await.unwrap();
    assert_eq!(batch.key.as_deref(), Some(patients[0]));
    assert_eq!(batch.items, messages0[..NUM_MESSAGES / 2].to_vec());
    queue.post_dequeue(patients[0]).await.unwrap();

    // All of patient1, batch size capped by what is there
    let batch = queue.dequeue(2 * NUM_MESSAGES).await.unwrap();
    assert_eq!(batch.key.as_deref(), Some(patients[1]));
    assert_eq!(batch.items, messages1);
    queue.post_dequeue(patients[1]).await.unwrap();

    // Rest of patient0: committed, then pushed back and redelivered verbatim
    let batch = queue.dequeue(NUM_MESSAGES).await.unwrap();
    assert_eq!(batch.key.as_deref(), Some(patients[0]));
    assert_eq!(batch.items, messages0[NUM_MESSAGES / 2..].to_vec());
    queue.post_dequeue(patients[0]).await.unwrap();
    queue.push_front(patients[0], &batch.items).await.unwrap();

    let redelivered = queue.dequeue(2 * NUM_MESSAGES).await.unwrap();
    assert_eq!(redelivered, batch);
    queue.post_dequeue(patients[0]).await.unwrap();

    // Committing twice is a protocol violation
    assert!(matches!(
        queue.post_dequeue(patients[0]).await,
        Err(QueueError::InvalidReservation { .. })
    ));

    let batch = queue.dequeue(NUM_MESSAGES).await.unwrap();
    assert!(batch.key.is_none());
    assert!(batch.items.is_empty());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.tracked_partitions, 0);
    assert_eq!(stats.open_reservations, 0);
}

async fn run_chronological_scenario(store: Arc<dyn WorkQueueStore>, namespace: &str) {
    let queue: ChronologicalWorkQueue<String> = ChronologicalWorkQueue::new(store, namespace);
    let mut messages = Vec::new();

    for i in 0..NUM_MESSAGES {
        let patient = format!("patient{}", i);
        let message = format!("{}_message{}", patient, i);
        queue.enqueue(&patient, &message, i as f64).await.unwrap();
        messages.push((patient, message));
    }

    let max = NUM_MESSAGES as f64 - 1.0;
    let batch = queue.dequeue(0.0, max, NUM_MESSAGES / 2).await.unwrap();
    assert_eq!(batch, messages[..NUM_MESSAGES / 2].to_vec());

    let batch = queue.dequeue(0.0, max, 2 * NUM_MESSAGES).await.unwrap();
    assert_eq!(batch, messages[NUM_MESSAGES / 2..].to_vec());

    assert!(queue.dequeue(0.0, max, NUM_MESSAGES).await.unwrap().is_empty());
}

async fn run_simple_scenario(store: Arc<dyn WorkQueueStore>, namespace: &str) {
    let queue: SimpleWorkQueue<String> = SimpleWorkQueue::new(store, namespace);
    let messages: Vec<String> = (0..NUM_MESSAGES).map(|i| format!("message#{}", i)).collect();
    for message in &messages {
        queue.enqueue(message).await.unwrap();
    }

    let batch = tokio_test::assert_ok!(queue.dequeue(2 * NUM_MESSAGES).await);
    assert_eq!(batch, messages);
    assert!(queue.dequeue(2 * NUM_MESSAGES).await.unwrap().is_empty());

    tokio_test::assert_ok!(queue.push_front(&batch).await);
    assert_eq!(queue.dequeue(2 * NUM_MESSAGES).await.unwrap(), batch);
}

#[tokio::test]
async fn test_sequential_scenario() {
    run_sequential_scenario(memory_store(), "it:sequential").await;
}

#[tokio::test]
async fn test_chronological_scenario() {
    run_chronological_scenario(memory_store(), "it:chronological").await;
}

#[tokio::test]
async fn test_simple_scenario() {
    run_simple_scenario(memory_store(), "it:simple").await;
}

#[tokio::test]
async fn test_simple_fifo_and_rollback_round_trip() {
    let queue: SimpleWorkQueue<u32> = SimpleWorkQueue::new(memory_store(), "it:p1");
    for i in 0..25 {
        queue.enqueue(&i).await.unwrap();
    }

    let first = queue.dequeue(7).await.unwrap();
    assert_eq!(first, (0..7).collect::<Vec<_>>());
    queue.push_front(&first).await.unwrap();
    assert_eq!(queue.dequeue(7).await.unwrap(), first);

    let rest = queue.dequeue(100).await.unwrap();
    assert_eq!(rest, (7..25).collect::<Vec<_>>());
    assert!(queue.dequeue(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sequential_per_key_order_across_batches() {
    let queue: SequentialWorkQueue<u32> = SequentialWorkQueue::new(
        memory_store(),
        "it:p3",
        SequentialConfig {
            max_partitions: 4,
            max_items_per_partition: 50,
            ..Default::default()
        },
    );
    let keys = ["a", "b", "c"];
    for i in 0..30 {
        queue.enqueue(keys[i % 3], &(i as u32)).await.unwrap();
    }

    let mut seen: std::collections::HashMap<String, Vec<u32>> = Default::default();
    let mut round = 0;
    loop {
        let batch = queue.dequeue(1 + round % 4).await.unwrap();
        let Some(key) = batch.key else { break };
        // Roll back every third batch; the redelivery must come first
        if round % 3 == 2 {
            queue.push_front(&key, &batch.items).await.unwrap();
        } else {
            seen.entry(key.clone()).or_default().extend(batch.items);
            queue.post_dequeue(&key).await.unwrap();
        }
        round += 1;
    }

    for (index, key) in keys.iter().enumerate() {
        let expected: Vec<u32> = (0..30).filter(|i| i % 3 == index).map(|i| i as u32).collect();
        assert_eq!(seen[*key], expected, "order broken for {}", key);
    }
}

#[tokio::test]
async fn test_round_robin_alternates_keys() {
    let queue = sequential_queue(memory_store(), "it:p4");
    for i in 0..4 {
        queue.enqueue("A", &format!("a{}", i)).await.unwrap();
        queue.enqueue("B", &format!("b{}", i)).await.unwrap();
    }

    let mut served = Vec::new();
    for _ in 0..8 {
        let batch = queue.dequeue(1).await.unwrap();
        let key = batch.key.unwrap();
        queue.post_dequeue(&key).await.unwrap();
        served.push(key);
    }

    assert_eq!(served, ["A", "B", "A", "B", "A", "B", "A", "B"]);
    assert!(queue.dequeue(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chronological_window_drains_in_score_order() {
    let queue: ChronologicalWorkQueue<u32> = ChronologicalWorkQueue::new(memory_store(), "it:p5");
    let scores = [7.5, 1.0, 3.25, 9.0, 3.25, 0.5, 12.0, 4.0];
    for (i, score) in scores.iter().enumerate() {
        queue.enqueue("k", &(i as u32), *score).await.unwrap();
    }

    let mut drained = Vec::new();
    loop {
        let batch = queue.dequeue(1.0, 9.0, 2).await.unwrap();
        if batch.is_empty() {
            break;
        }
        assert!(batch.len() <= 2);
        drained.extend(batch.into_iter().map(|(_, item)| item));
    }

    // Scores 1.0, 3.25 (x2, insertion order), 4.0, 7.5, 9.0
    assert_eq!(drained, vec![1, 2, 4, 7, 0, 3]);
    // 0.5 and 12.0 are outside the window
    assert_eq!(queue.len().await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn test_sequential_scenario_on_redis() {
    run_sequential_scenario(redis_store().await, &fresh_namespace("sequential")).await;
}

#[tokio::test]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn test_chronological_scenario_on_redis() {
    run_chronological_scenario(redis_store().await, &fresh_namespace("chronological")).await;
}

#[tokio::test]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn test_simple_scenario_on_redis() {
    run_simple_scenario(redis_store().await, &fresh_namespace("simple")).await;
}
