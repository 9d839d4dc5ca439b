//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    CAPACITY_REJECTIONS_TOTAL, COMMIT_CONFLICTS_TOTAL, CONTENTION_FAILURES_TOTAL,
    ITEMS_DEQUEUED_TOTAL, ITEMS_ENQUEUED_TOTAL, ITEMS_RESTORED_TOTAL, RESERVATIONS_COMMITTED_TOTAL,
    RESERVATIONS_OPENED_TOTAL, RESERVATIONS_RECLAIMED_TOTAL, RESERVATIONS_ROLLED_BACK_TOTAL,
    STORE_ERRORS_TOTAL, STORE_OPERATION_LATENCY,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Item flow, labelled by queue kind (`simple`, `sequential`, `chronological`)
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued(queue: &str, count: usize) {
        ITEMS_ENQUEUED_TOTAL
            .with_label_values(&[queue])
            .inc_by(count as u64);
    }

    pub fn record_dequeued(queue: &str, count: usize) {
        ITEMS_DEQUEUED_TOTAL
            .with_label_values(&[queue])
            .inc_by(count as u64);
    }

    pub fn record_restored(queue: &str, count: usize) {
        ITEMS_RESTORED_TOTAL
            .with_label_values(&[queue])
            .inc_by(count as u64);
    }

    pub fn record_capacity_rejection(limit: &str) {
        CAPACITY_REJECTIONS_TOTAL.with_label_values(&[limit]).inc();
    }
}

pub struct ReservationMetrics;

impl ReservationMetrics {
    pub fn record_opened() {
        RESERVATIONS_OPENED_TOTAL.inc();
    }

    pub fn record_committed() {
        RESERVATIONS_COMMITTED_TOTAL.inc();
    }

    pub fn record_rolled_back() {
        RESERVATIONS_ROLLED_BACK_TOTAL.inc();
    }

    pub fn record_reclaimed(count: usize) {
        RESERVATIONS_RECLAIMED_TOTAL.inc_by(count as u64);
    }
}

pub struct StoreMetrics;

impl StoreMetrics {
    pub fn observe_latency(backend: &str, operation: &str, elapsed: Duration) {
        STORE_OPERATION_LATENCY
            .with_label_values(&[backend, operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_error(backend: &str, operation: &str) {
        STORE_ERRORS_TOTAL
            .with_label_values(&[backend, operation])
            .inc();
    }

    pub fn record_conflict(operation: &str) {
        COMMIT_CONFLICTS_TOTAL.with_label_values(&[operation]).inc();
    }

    pub fn record_contention_failure(operation: &str) {
        CONTENTION_FAILURES_TOTAL
            .with_label_values(&[operation])
            .inc();
    }
}
