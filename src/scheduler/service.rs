//! The scheduler service: every component wired from one configuration.
//!
//! [`Scheduler`] owns the queues, one assembler per queue key, the admission
//! gate, the dispatcher and the worker pool. The operator surfaces (HTTP API
//! and CLI) only ever talk to this type.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::assembler::{AssemblerConfig, BatchAssembler, BatchHandler};
use super::backend::ComputeBackend;
use super::callback::{CallbackDelivery, CallbackSender};
use super::dispatcher::{DispatchPolicy, Dispatcher, GatedDispatcher};
use super::gate::AdmissionGate;
use super::queue::{PriorityTaskQueue, StoryQueue};
use super::splitter::TaskSplitter;
use super::task::{QueueKey, StoryRequest};
use super::worker_pool::{PoolError, WorkerPool, WorkerPoolConfig, WorkerSnapshot};
use crate::config::SchedulerConfig;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::store::QueueStore;

/// Point-in-time view of the service for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// `healthy`, or `degraded` when the queue store could not be read.
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub gpu_service_healthy: bool,
    pub active_workers: usize,
    pub workers: Vec<WorkerSnapshot>,
    /// Lengths of the task queues and the story admission lists.
    pub queue_lengths: BTreeMap<String, usize>,
}

/// The batching scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn QueueStore>,
    tasks: PriorityTaskQueue,
    stories: StoryQueue,
    gate: Arc<AdmissionGate>,
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
    shutdown_tx: broadcast::Sender<()>,
    assemblers: Mutex<Vec<JoinHandle<()>>>,
    metrics: MetricsCollector,
}

impl Scheduler {
    /// Wires a scheduler around the given collaborators. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn QueueStore>,
        backend: Arc<dyn ComputeBackend>,
        callback_sender: Arc<dyn CallbackSender>,
    ) -> Self {
        let tasks = PriorityTaskQueue::new(Arc::clone(&store));
        let stories = StoryQueue::new(Arc::clone(&store));

        let callbacks = Arc::new(CallbackDelivery::new(
            callback_sender,
            tasks.clone(),
            config.callback_max_attempts,
            config.callback_backoff,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            backend,
            tasks.clone(),
            callbacks,
            DispatchPolicy {
                max_attempts: config.max_batch_retries,
                backoff: config.dispatch_backoff,
                backoff_max: config.dispatch_backoff_max,
            },
        ));
        let gate = AdmissionGate::new(config.max_concurrent_batches, config.priority_ratio);

        let pool = WorkerPool::new(
            WorkerPoolConfig::default()
                .with_poll_interval(config.idle_backoff)
                .with_grace_period(config.worker_grace_period)
                .with_story_max_attempts(config.story_max_attempts),
            stories.clone(),
            TaskSplitter::new(tasks.clone(), stories.clone()),
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            tasks,
            stories,
            gate,
            dispatcher,
            pool,
            shutdown_tx,
            assemblers: Mutex::new(Vec::new()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Spawns one assembler per queue key and the initial workers.
    ///
    /// Calling it on a running scheduler does nothing.
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut assemblers = self.assemblers.lock().expect("assembler lock poisoned");
            if !assemblers.is_empty() {
                warn!("Scheduler already started");
                return Ok(());
            }

            let handler: Arc<dyn BatchHandler> = Arc::new(GatedDispatcher::new(
                Arc::clone(&self.gate),
                Arc::clone(&self.dispatcher),
            ));
            let assembler_config = AssemblerConfig {
                max_batch_size: self.config.max_batch_size,
                max_batch_wait: self.config.max_batch_wait,
                idle_backoff: self.config.idle_backoff,
            };

            for key in QueueKey::all() {
                let assembler = BatchAssembler::new(
                    key,
                    self.tasks.clone(),
                    Arc::clone(&handler),
                    assembler_config,
                    self.shutdown_tx.subscribe(),
                );
                assemblers.push(assembler.spawn());
            }
        }

        self.pool.start(self.config.initial_workers).await?;

        info!(
            assemblers = QueueKey::all().len(),
            workers = self.config.initial_workers,
            max_batch_size = self.config.max_batch_size,
            max_batch_wait_ms = self.config.max_batch_wait.as_millis() as u64,
            priority_ratio = %self.config.priority_ratio,
            "Scheduler started"
        );
        Ok(())
    }

    /// Accepts a story for decomposition and returns its request id.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the story could not be queued.
    pub async fn submit_story(&self, story: StoryRequest) -> Result<Uuid, QueueError> {
        self.stories.enqueue_story(&story).await?;
        info!(
            request_id = %story.request_id,
            user_id = %story.user_id,
            priority = %story.priority,
            "Story queued"
        );
        Ok(story.request_id)
    }

    /// Queue lengths, worker states and backend health.
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let mut status = "healthy";
        let mut queue_lengths = BTreeMap::new();

        match self.tasks.lengths().await {
            Ok(lengths) => queue_lengths.extend(lengths),
            Err(e) => {
                warn!(error = %e, "Failed to read task queue lengths");
                status = "degraded";
            }
        }
        match self.stories.lengths().await {
            Ok(lengths) => queue_lengths.extend(
                lengths
                    .into_iter()
                    .map(|(class, len)| (format!("story_queue:{}", class), len)),
            ),
            Err(e) => {
                warn!(error = %e, "Failed to read story queue lengths");
                status = "degraded";
            }
        }
        for (queue, depth) in &queue_lengths {
            self.metrics.update_queue_depth(queue, *depth);
        }

        HealthSnapshot {
            status: status.to_string(),
            timestamp: Utc::now(),
            gpu_service_healthy: self.dispatcher.health().await,
            active_workers: self.pool.active_count(),
            workers: self.pool.snapshot(),
            queue_lengths,
        }
    }

    /// Resizes the worker pool within the configured bounds.
    ///
    /// # Errors
    ///
    /// - `PoolError::OutOfBounds` if `count` is outside `[min_workers, max_workers]`
    /// - `PoolError::ResizeTimeout` if removed workers did not stop in time
    pub async fn resize_workers(&self, count: usize) -> Result<(), PoolError> {
        if count < self.config.min_workers || count > self.config.max_workers {
            return Err(PoolError::OutOfBounds {
                requested: count,
                min: self.config.min_workers,
                max: self.config.max_workers,
            });
        }
        self.pool.resize(count).await
    }

    /// Stops the workers, then the assemblers.
    ///
    /// Workers finish their in-flight stories and assemblers dispatch their
    /// partial batches before returning. Tasks still queued stay in the store.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Initiating scheduler shutdown");

        if let Err(e) = self.pool.stop().await {
            error!(error = %e, "Worker pool did not stop cleanly");
        }

        // Ignore send error - assemblers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = {
            let mut assemblers = self.assemblers.lock().expect("assembler lock poisoned");
            assemblers.drain(..).collect()
        };
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Assembler task panicked during shutdown");
                    }
                }
                info!("Scheduler shutdown complete");
            }
            Err(_) => warn!(
                timeout_secs = timeout.as_secs_f64(),
                "Scheduler shutdown timed out with batches still in flight"
            ),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn tasks(&self) -> &PriorityTaskQueue {
        &self.tasks
    }

    pub fn stories(&self) -> &StoryQueue {
        &self.stories
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, DeliveryError};
    use crate::scheduler::backend::BatchResponse;
    use crate::scheduler::callback::CallbackPayload;
    use crate::scheduler::task::{Batch, Priority};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct EchoBackend;

    #[async_trait]
    impl ComputeBackend for EchoBackend {
        async fn process_batch(&self, batch: &Batch) -> Result<BatchResponse, BackendError> {
            Ok(BatchResponse {
                task_results: batch
                    .tasks
                    .iter()
                    .map(|t| serde_json::json!({ "task_id": t.task_id }))
                    .collect(),
            })
        }

        async fn health(&self) -> bool {
            true
        }
    }

    struct NullSender;

    #[async_trait]
    impl CallbackSender for NullSender {
        async fn send(&self, _url: &str, _payload: &CallbackPayload) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn scheduler() -> Scheduler {
        let config = SchedulerConfig::default()
            .with_workers(1, 1, 4)
            .with_idle_backoff(Duration::from_millis(10))
            .with_worker_grace_period(Duration::from_secs(2));
        Scheduler::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(EchoBackend),
            Arc::new(NullSender),
        )
    }

    #[tokio::test]
    async fn test_resize_bounds() {
        let scheduler = scheduler();

        let err = scheduler.resize_workers(0).await.unwrap_err();
        assert!(matches!(err, PoolError::OutOfBounds { requested: 0, min: 1, max: 4 }));
        let err = scheduler.resize_workers(5).await.unwrap_err();
        assert!(matches!(err, PoolError::OutOfBounds { requested: 5, .. }));

        scheduler.resize_workers(3).await.unwrap();
        assert_eq!(scheduler.pool().active_count(), 3);
        scheduler.shutdown(Duration::from_secs(2)).await;
        assert_eq!(scheduler.pool().active_count(), 0);
    }

    #[tokio::test]
    async fn test_health_snapshot_lists_every_queue() {
        let scheduler = scheduler();
        let story = StoryRequest::new("u1", Priority::Free, "scene", "http://cb");
        scheduler.submit_story(story).await.unwrap();

        let health = scheduler.health_snapshot().await;
        assert_eq!(health.status, "healthy");
        assert!(health.gpu_service_healthy);
        assert_eq!(health.active_workers, 0);
        assert_eq!(health.queue_lengths.len(), 8);
        assert_eq!(health.queue_lengths["story_queue:free"], 1);
        assert_eq!(health.queue_lengths["clip_queue:premium"], 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let scheduler = scheduler();
        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        assert_eq!(scheduler.pool().active_count(), 1);

        scheduler.shutdown(Duration::from_secs(5)).await;
        assert_eq!(scheduler.pool().active_count(), 0);
        assert!(scheduler.assemblers.lock().unwrap().is_empty());
    }
}
