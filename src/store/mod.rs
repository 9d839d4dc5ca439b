//! Shared store the work queues are layered on.
//!
//! # Architecture
//!
//! - `WorkQueueStore`: read primitives plus a version-guarded atomic commit
//! - `RedisStore`: Redis backend, one Lua script per commit
//! - `MemoryStore`: in-process backend with the same semantics
//!
//! Use `create_store()` to pick the backend from configuration.

pub mod backend;
mod factory;
pub mod memory_backend;
pub mod redis_backend;

pub use backend::{Guard, ListEnd, OpReply, StoreOp, WorkQueueStore};
pub use factory::create_store;
pub use memory_backend::MemoryStore;
pub use redis_backend::RedisStore;
