//! Store backend factory

use std::sync::Arc;

use crate::config::Settings;
use crate::error::StoreError;

use super::backend::WorkQueueStore;
use super::memory_backend::MemoryStore;
use super::redis_backend::RedisStore;

/// Create a store backend based on configuration.
///
/// - `"redis"`: a `RedisStore` for `settings.redis.url`. The connection is
///   opened on first use. A URL that cannot be parsed is an error, never a
///   silent switch to a process-local store.
/// - `"memory"`: a process-local `MemoryStore`
///
/// Unknown backend names fall back to memory with a warning.
pub fn create_store(settings: &Settings) -> Result<Arc<dyn WorkQueueStore>, StoreError> {
    match settings.store.backend.as_str() {
        "redis" => {
            let store = RedisStore::from_config(&settings.redis, &settings.store).map_err(|e| {
                tracing::error!(error = %e, url = %settings.redis.url, "Redis store could not be configured");
                e
            })?;
            tracing::info!(
                backend = "redis",
                url = %settings.redis.url,
                versions_key = %settings.store.versions_key,
                "Creating Redis work queue store"
            );
            Ok(Arc::new(store))
        }
        "memory" => {
            tracing::info!(backend = "memory", "Creating memory work queue store");
            Ok(Arc::new(MemoryStore::new()))
        }
        other => {
            tracing::warn!(backend = %other, "Unknown store backend, using memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
