//! Bounded retry loop for optimistic commits

use crate::error::QueueError;
use crate::metrics::StoreMetrics;
use crate::redis::ExponentialBackoff;

use super::models::RetryConfig;

/// Tracks the attempts of one logical operation.
///
/// Call [`conflict`](CommitRetry::conflict) each time a guarded commit is
/// rejected. It sleeps before the next attempt, or fails with
/// `StoreContention` once the budget is spent.
pub(crate) struct CommitRetry {
    operation: &'static str,
    max_attempts: u32,
    attempts: u32,
    backoff: ExponentialBackoff,
}

impl CommitRetry {
    pub fn new(operation: &'static str, config: &RetryConfig) -> Self {
        Self {
            operation,
            max_attempts: config.max_attempts.max(1),
            attempts: 0,
            backoff: ExponentialBackoff::with_config(config.backoff.clone()),
        }
    }

    pub async fn conflict(&mut self) -> Result<(), QueueError> {
        self.attempts += 1;
        StoreMetrics::record_conflict(self.operation);

        if self.attempts >= self.max_attempts {
            StoreMetrics::record_contention_failure(self.operation);
            tracing::warn!(
                operation = self.operation,
                attempts = self.attempts,
                "Giving up on contended commit"
            );
            return Err(QueueError::StoreContention {
                attempts: self.attempts,
            });
        }

        let delay = self.backoff.next_delay();
        tracing::debug!(
            operation = self.operation,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "Commit lost a race, retrying"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
