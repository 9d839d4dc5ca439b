//! Exponential backoff with jitter, shared by reconnects and commit retries

use std::time::Duration;

use rand::Rng;

use crate::config::{QueueSettings, RedisConfig};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth per attempt
    pub multiplier: f64,
    /// Relative spread applied to each delay, 0.0 to 1.0
    pub jitter_factor: f64,
}

impl BackoffConfig {
    /// Backoff for reconnecting to Redis.
    pub fn for_reconnect(config: &RedisConfig) -> Self {
        Self {
            initial_delay_ms: config.backoff_initial_delay_ms,
            max_delay_ms: config.backoff_max_delay_ms,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Backoff between optimistic commit attempts. Contending consumers
    /// tend to retry in lockstep, so the jitter is wider than for reconnects.
    pub fn for_commit_retry(settings: &QueueSettings) -> Self {
        Self {
            initial_delay_ms: settings.retry_initial_delay_ms,
            max_delay_ms: settings.retry_max_delay_ms,
            multiplier: 2.0,
            jitter_factor: 0.5,
        }
    }
}

/// Delay sequence for one retry loop.
///
/// The n-th delay is `initial * multiplier^(n-1)`, capped at the maximum,
/// then scaled by a random factor in `1 ± jitter_factor`. Never below 1ms.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(i32::MAX as u32) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let grown = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = grown.min(self.config.max_delay_ms as f64);

        let jitter = self.config.jitter_factor.clamp(0.0, 1.0);
        let scaled = if jitter > 0.0 {
            capped * rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
        } else {
            capped
        };

        Duration::from_millis(scaled.max(1.0) as u64)
    }

    /// Delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
