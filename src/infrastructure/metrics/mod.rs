//! Prometheus metrics for the work queues.
//!
//! - Item flow per queue kind (enqueued, dequeued)
//! - Reservation outcomes (committed, rolled back, reclaimed)
//! - Optimistic commit conflicts and contention failures
//! - Capacity rejections
//! - Store round-trip latency and errors

mod helpers;

pub use helpers::{encode_metrics, QueueMetrics, ReservationMetrics, StoreMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "workqueue";

lazy_static! {
    // ============================================================================
    // Item Metrics
    // ============================================================================

    /// Items enqueued by queue kind
    pub static ref ITEMS_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_enqueued_total", METRIC_PREFIX),
        "Total items enqueued",
        &["queue"]
    ).unwrap();

    /// Items handed to consumers by queue kind
    pub static ref ITEMS_DEQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_dequeued_total", METRIC_PREFIX),
        "Total items dequeued",
        &["queue"]
    ).unwrap();

    /// Items pushed back to the head of a queue
    pub static ref ITEMS_RESTORED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_restored_total", METRIC_PREFIX),
        "Total items pushed back to the front of a queue",
        &["queue"]
    ).unwrap();

    /// Enqueues refused by a capacity bound
    pub static ref CAPACITY_REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_capacity_rejections_total", METRIC_PREFIX),
        "Total enqueues rejected by a capacity limit",
        &["limit"]
    ).unwrap();

    // ============================================================================
    // Reservation Metrics
    // ============================================================================

    pub static ref RESERVATIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reservations_opened_total", METRIC_PREFIX),
        "Total partition reservations opened by dequeue"
    ).unwrap();

    pub static ref RESERVATIONS_COMMITTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reservations_committed_total", METRIC_PREFIX),
        "Total partition reservations committed"
    ).unwrap();

    pub static ref RESERVATIONS_ROLLED_BACK_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reservations_rolled_back_total", METRIC_PREFIX),
        "Total partition reservations rolled back"
    ).unwrap();

    /// Reservations rolled back because their lease ran out
    pub static ref RESERVATIONS_RECLAIMED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reservations_reclaimed_total", METRIC_PREFIX),
        "Total expired partition reservations reclaimed"
    ).unwrap();

    // ============================================================================
    // Store Metrics
    // ============================================================================

    /// Guarded commits rejected because a guarded key changed
    pub static ref COMMIT_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_commit_conflicts_total", METRIC_PREFIX),
        "Total optimistic commits rejected by a concurrent write",
        &["operation"]
    ).unwrap();

    /// Operations that exhausted their commit attempts
    pub static ref CONTENTION_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_contention_failures_total", METRIC_PREFIX),
        "Total operations abandoned after exhausting commit attempts",
        &["operation"]
    ).unwrap();

    pub static ref STORE_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_store_operation_latency_seconds", METRIC_PREFIX),
        "Store round-trip latency in seconds",
        &["backend", "operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Total failed store round-trips",
        &["backend", "operation"]
    ).unwrap();
}
