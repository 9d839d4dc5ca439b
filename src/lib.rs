// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::redis;

// Store and queues
pub mod queue;
pub mod store;

// Supporting modules
pub mod telemetry;

pub use error::{CapacityLimit, QueueError, StoreError};
pub use queue::{
    Batch, ChronologicalWorkQueue, SequentialConfig, SequentialWorkQueue, SimpleWorkQueue,
};
pub use store::{create_store, MemoryStore, RedisStore, WorkQueueStore};
