use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    /// Half-open successes before the circuit closes again
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    #[serde(default = "default_backoff_initial_delay")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay")]
    pub backoff_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `"redis"` or `"memory"`
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// Redis hash holding the per-key write versions
    #[serde(default = "default_versions_key")]
    pub versions_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Prefix for every key the queues create
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_max_partitions")]
    pub max_partitions: usize,
    #[serde(default = "default_max_items_per_partition")]
    pub max_items_per_partition: usize,
    /// Commit attempts before an operation reports contention
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Lease after which the inspector reclaims open reservations
    #[serde(default)]
    pub reclaim_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    /// Emit log lines as JSON instead of the human-readable format
    #[serde(default)]
    pub json_logs: bool,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_backoff_initial_delay() -> u64 {
    100
}

fn default_backoff_max_delay() -> u64 {
    30_000
}

fn default_store_backend() -> String {
    "redis".to_string()
}

fn default_versions_key() -> String {
    "workqueue:versions".to_string()
}

fn default_namespace() -> String {
    "workqueue".to_string()
}

fn default_max_partitions() -> usize {
    10
}

fn default_max_items_per_partition() -> usize {
    10
}

fn default_max_commit_attempts() -> u32 {
    16
}

fn default_retry_initial_delay() -> u64 {
    5
}

fn default_retry_max_delay() -> u64 {
    250
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "redis-workqueue".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("redis.url", default_redis_url())?
            .set_default("store.backend", default_store_backend())?
            .set_default("queue.namespace", default_namespace())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // WORKQUEUE__REDIS__URL, WORKQUEUE__QUEUE__MAX_PARTITIONS, ...
            .add_source(
                Environment::with_prefix("WORKQUEUE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
            backoff_initial_delay_ms: default_backoff_initial_delay(),
            backoff_max_delay_ms: default_backoff_max_delay(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            versions_key: default_versions_key(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_partitions: default_max_partitions(),
            max_items_per_partition: default_max_items_per_partition(),
            max_commit_attempts: default_max_commit_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            reclaim_after_seconds: None,
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
            json_logs: false,
        }
    }
}
