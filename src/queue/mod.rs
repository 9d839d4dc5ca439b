//! Work queues layered on a shared [`WorkQueueStore`](crate::store::WorkQueueStore).
//!
//! - `SimpleWorkQueue`: one FIFO with batch dequeue and rollback
//! - `SequentialWorkQueue`: per-key FIFOs served round-robin, one consumer
//!   per key at a time, with commit/rollback of each batch
//! - `ChronologicalWorkQueue`: records scored by time, dequeued by window
//!
//! Items are opaque to the queues and stored as JSON bytes.

mod chronological;
mod models;
mod retry;
mod sequential;
mod simple;

pub use chronological::ChronologicalWorkQueue;
pub use models::{Batch, RetryConfig, SequentialConfig, SequentialQueueStats};
pub use sequential::SequentialWorkQueue;
pub use simple::SimpleWorkQueue;
