mod settings;

pub use settings::{OtelConfig, QueueSettings, RedisConfig, Settings, StoreConfig};
