//! Recording helpers for scheduler metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics and keeps label
//! values consistent across the scheduler. Every method is a no-op until
//! [`init_metrics`](super::init_metrics) has run, so components can record
//! unconditionally, including in tests.

use super::prometheus::{
    ACTIVE_WORKERS, BATCHES_IN_FLIGHT, BATCHES_TOTAL, BATCH_SIZE, CALLBACKS_TOTAL,
    DISPATCH_DURATION, QUEUE_DEPTH, STORIES_TOTAL, TASKS_TOTAL,
};

/// Metrics collector for recording scheduler operational metrics.
///
/// # Example
///
/// ```ignore
/// use storee::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_batch("scene:premium", true, 6, 2.5);
/// collector.record_callback(true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a resolved batch.
    ///
    /// # Arguments
    ///
    /// * `queue_key` - Queue key of the batch (e.g. "scene:premium")
    /// * `success` - Whether the backend answered, false when dead-lettered
    /// * `size` - Number of tasks in the batch
    /// * `duration_secs` - Time spent dispatching, retries included
    pub fn record_batch(&self, queue_key: &str, success: bool, size: usize, duration_secs: f64) {
        let outcome = if success { "processed" } else { "dead_lettered" };

        if let Some(batches_total) = BATCHES_TOTAL.get() {
            batches_total.with_label_values(&[queue_key, outcome]).inc();
        }

        if let Some(batch_size) = BATCH_SIZE.get() {
            batch_size.observe(size as f64);
        }

        if let Some(dispatch_duration) = DISPATCH_DURATION.get() {
            dispatch_duration
                .with_label_values(&[queue_key])
                .observe(duration_secs);
        }

        tracing::trace!(
            queue_key = queue_key,
            outcome = outcome,
            size = size,
            duration_secs = duration_secs,
            "Recorded batch metric"
        );
    }

    /// Record per-task outcomes of one batch.
    pub fn record_task_outcomes(&self, succeeded: usize, failed: usize) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&["completed"])
                .inc_by(succeeded as f64);
            tasks_total
                .with_label_values(&["failed"])
                .inc_by(failed as f64);
        }
    }

    /// Record the final state of one callback.
    pub fn record_callback(&self, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "undelivered" };
        if let Some(callbacks_total) = CALLBACKS_TOTAL.get() {
            callbacks_total.with_label_values(&[outcome]).inc();
        }
    }

    /// Record how a worker disposed of a story
    /// ("decomposed", "requeued" or "dead_lettered").
    pub fn record_story(&self, outcome: &str) {
        if let Some(stories_total) = STORIES_TOTAL.get() {
            stories_total.with_label_values(&[outcome]).inc();
        }

        tracing::trace!(outcome = outcome, "Recorded story metric");
    }

    /// Update the queue depth for a specific queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    /// Increment the count of admitted batches by 1.
    pub fn inc_batches_in_flight(&self) {
        if let Some(in_flight) = BATCHES_IN_FLIGHT.get() {
            in_flight.inc();
        }
    }

    /// Decrement the count of admitted batches by 1.
    pub fn dec_batches_in_flight(&self) {
        if let Some(in_flight) = BATCHES_IN_FLIGHT.get() {
            in_flight.dec();
        }
    }
}
