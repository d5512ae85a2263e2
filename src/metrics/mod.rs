//! Metrics module for Prometheus-based monitoring.
//!
//! Covers queue depths, batch dispatch, task and callback outcomes, story
//! handling and the size of the worker pool.
//!
//! # Example
//!
//! ```ignore
//! use storee::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.update_queue_depth("scene_queue:premium", 12);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_WORKERS, BATCHES_IN_FLIGHT, BATCHES_TOTAL, BATCH_SIZE, CALLBACKS_TOTAL,
    DISPATCH_DURATION, QUEUE_DEPTH, REGISTRY, STORIES_TOTAL, TASKS_TOTAL,
};
