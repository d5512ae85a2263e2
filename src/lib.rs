//! storee: priority-aware story batching scheduler.
//!
//! Stories are split into character, scene and clip subtasks, queued per
//! (task type, priority), assembled into size/time-bounded batches and sent
//! to a compute backend with premium traffic weighted ahead of free traffic.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigError, PriorityRatio, SchedulerConfig};
pub use error::{BackendError, DecompositionError, DeliveryError, QueueError};
