//! Priority-aware story batching with a resizable worker pool.
//!
//! This module provides the scheduling engine:
//!
//! - **StoryQueue**: two-class (paid, free) admission queue for submitted stories
//! - **WorkerPool**: resizable set of workers that decompose stories
//! - **TaskSplitter**: story → ordered character/scene/clip subtasks, enqueued
//!   all-or-nothing
//! - **PriorityTaskQueue**: one FIFO list per (task type, priority) key
//! - **BatchAssembler**: one per key; size/time bounded batches
//! - **AdmissionGate**: bounded, premium-weighted admission to the backend
//! - **Dispatcher**: batch dispatch with retry, dead-lettering and callbacks
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  API / CLI   │
//!                      └──────┬───────┘
//!                             │ submit_story
//!                      ┌──────▼───────┐
//!                      │ story_queue  │  paid before free
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│   TaskSplitter
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!        char_queue:* / scene_queue:* / clip_queue:*   (6 keys)
//!                             │
//!                   one BatchAssembler per key
//!                             │
//!                      ┌──────▼───────┐
//!                      │AdmissionGate │  premium:free weighted
//!                      └──────┬───────┘
//!                      ┌──────▼───────┐
//!                      │  Dispatcher  │──▶ compute backend
//!                      └──────┬───────┘
//!                             ▼
//!                     callbacks to submitters
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use storee::config::SchedulerConfig;
//! use storee::scheduler::{HttpCallbackSender, HttpComputeBackend, Priority, Scheduler, StoryRequest};
//! use storee::store::RedisStore;
//!
//! let config = SchedulerConfig::from_env()?;
//! let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
//! let backend = Arc::new(HttpComputeBackend::new(&config.backend_url, None, config.backend_timeout)?);
//! let callbacks = Arc::new(HttpCallbackSender::new(config.callback_timeout)?);
//!
//! let scheduler = Scheduler::new(config, store, backend, callbacks);
//! scheduler.start().await?;
//! scheduler
//!     .submit_story(StoryRequest::new("user-1", Priority::Premium, "Dawn.\n\nDusk.", "http://me/cb"))
//!     .await?;
//! ```
//!
//! # Reliability Features
//!
//! - **All-or-nothing decomposition**: partial enqueues are rolled back, or
//!   marked in `story_queue:incomplete` when rollback is impossible
//! - **Dead letter lists**: exhausted batches, stories and callbacks are kept
//!   for inspection
//! - **Graceful resize**: removed workers finish their in-flight story; a
//!   resize that times out leaves the pool at its previous size

pub mod assembler;
pub mod backend;
pub mod callback;
pub mod dispatcher;
pub mod gate;
pub mod queue;
pub mod service;
pub mod splitter;
pub mod task;
pub mod worker_pool;

// Re-export main types for convenience
pub use assembler::{AssemblerConfig, AssemblerState, BatchAssembler, BatchHandler};
pub use backend::{BatchResponse, ComputeBackend, HttpComputeBackend};
pub use callback::{CallbackDelivery, CallbackPayload, CallbackSender, DeliveryOutcome, HttpCallbackSender};
pub use dispatcher::{DispatchPolicy, Dispatcher, GatedDispatcher};
pub use gate::{AdmissionGate, GatePermit};
pub use queue::{peek_dead_letters, DeadLetterKind, IncompleteStory, PriorityTaskQueue, StoryQueue};
pub use service::{HealthSnapshot, Scheduler};
pub use splitter::{Decomposition, TaskSplitter};
pub use task::{Batch, BatchResult, Priority, QueueKey, StoryRequest, TaskOutcome, TaskRecord, TaskType};
pub use worker_pool::{PoolError, WorkerPool, WorkerPoolConfig, WorkerSnapshot, WorkerStatus};
