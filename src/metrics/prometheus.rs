//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by storee and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all storee metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of records in a queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Total batches resolved, labeled by queue key and outcome.
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of batch sizes.
pub static BATCH_SIZE: OnceLock<Histogram> = OnceLock::new();

/// Time from first dispatch attempt to resolution, labeled by queue key.
pub static DISPATCH_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of batches currently holding an admission slot.
pub static BATCHES_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Total tasks resolved, labeled by outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total callbacks, labeled by outcome (delivered/undelivered).
pub static CALLBACKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total stories handled by workers, labeled by outcome.
pub static STORIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of active story workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Serializes initialization so every static comes from the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again is harmless: the first set of metrics stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("storee_queue_depth", "Number of records in queue"),
        &["queue_name"],
    )?;

    // Batch metrics
    let batches_total = CounterVec::new(
        Opts::new("storee_batches_total", "Total number of batches resolved"),
        &["queue_key", "outcome"],
    )?;

    let batch_size = Histogram::with_opts(
        prometheus::HistogramOpts::new("storee_batch_size", "Number of tasks per batch")
            .buckets(vec![1.0, 2.0, 4.0, 6.0, 8.0, 10.0, 16.0, 32.0]),
    )?;

    let dispatch_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "storee_dispatch_duration_seconds",
            "Batch dispatch duration in seconds, retries included",
        )
        .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["queue_key"],
    )?;

    let batches_in_flight = Gauge::new(
        "storee_batches_in_flight",
        "Number of batches currently admitted to the backend",
    )?;

    // Task and callback metrics
    let tasks_total = CounterVec::new(
        Opts::new("storee_tasks_total", "Total number of tasks resolved"),
        &["outcome"],
    )?;

    let callbacks_total = CounterVec::new(
        Opts::new("storee_callbacks_total", "Total number of completion callbacks"),
        &["outcome"],
    )?;

    // Worker metrics
    let stories_total = CounterVec::new(
        Opts::new("storee_stories_total", "Total number of stories handled"),
        &["outcome"],
    )?;

    let active_workers = Gauge::new("storee_active_workers", "Number of active story workers")?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(batch_size.clone()))?;
    registry.register(Box::new(dispatch_duration.clone()))?;
    registry.register(Box::new(batches_in_flight.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(callbacks_total.clone()))?;
    registry.register(Box::new(stories_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = BATCH_SIZE.set(batch_size);
    let _ = DISPATCH_DURATION.set(dispatch_duration);
    let _ = BATCHES_IN_FLIGHT.set(batches_in_flight);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = CALLBACKS_TOTAL.set(callbacks_total);
    let _ = STORIES_TOTAL.set(stories_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_never_empty() {
        // Output depends on test order: either real metrics or the notice.
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(3.0);
        }
        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("storee_active_workers"));
    }
}
