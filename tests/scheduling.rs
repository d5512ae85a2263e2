//! End-to-end scheduling tests against the in-memory store.
//!
//! The compute backend and callback transport are replaced by in-process
//! fakes; everything else runs as in production.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use storee::config::SchedulerConfig;
use storee::error::{BackendError, DeliveryError};
use storee::scheduler::dispatcher::BACKEND_UNAVAILABLE;
use storee::scheduler::queue::BATCH_DEAD_LETTER_QUEUE;
use storee::scheduler::{
    AdmissionGate, Batch, BatchResponse, CallbackDelivery, CallbackPayload, CallbackSender,
    ComputeBackend, DispatchPolicy, Dispatcher, Priority, PriorityTaskQueue, QueueKey, Scheduler,
    StoryRequest, TaskOutcome, TaskRecord, TaskType,
};
use storee::store::{MemoryStore, QueueStore};

/// Answers every batch with one result per task.
#[derive(Default)]
struct EchoBackend {
    batches: Mutex<Vec<Batch>>,
}

#[async_trait]
impl ComputeBackend for EchoBackend {
    async fn process_batch(&self, batch: &Batch) -> Result<BatchResponse, BackendError> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(BatchResponse {
            task_results: batch
                .tasks
                .iter()
                .map(|t| serde_json::json!({ "task_id": t.task_id, "status": "done" }))
                .collect(),
        })
    }

    async fn health(&self) -> bool {
        true
    }
}

/// Answers 500 to everything.
#[derive(Default)]
struct BrokenBackend {
    calls: AtomicU32,
}

#[async_trait]
impl ComputeBackend for BrokenBackend {
    async fn process_batch(&self, _batch: &Batch) -> Result<BatchResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Status {
            code: 500,
            body: "internal error".to_string(),
        })
    }

    async fn health(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct RecordingSender {
    received: Mutex<Vec<(String, CallbackPayload)>>,
}

#[async_trait]
impl CallbackSender for RecordingSender {
    async fn send(&self, url: &str, payload: &CallbackPayload) -> Result<(), DeliveryError> {
        self.received
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        Ok(())
    }
}

impl RecordingSender {
    async fn wait_for(&self, count: usize, limit: Duration) -> Vec<(String, CallbackPayload)> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if self.received.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received.lock().unwrap().clone()
    }
}

fn task(key: QueueKey, index: usize) -> TaskRecord {
    TaskRecord {
        task_id: uuid::Uuid::new_v4(),
        task_type: key.task_type,
        priority: key.priority,
        story_id: "story-1".to_string(),
        user_id: "user-1".to_string(),
        scene_index: index,
        prompt: format!("Generate scene for: scene {}...", index),
        callback_url: "http://submitter/cb".to_string(),
        created_at: None,
    }
}

#[tokio::test]
async fn test_story_flows_from_submission_to_callbacks() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(EchoBackend::default());
    let sender = Arc::new(RecordingSender::default());

    let config = SchedulerConfig::default()
        .with_workers(1, 1, 4)
        .with_batching(10, Duration::from_millis(200))
        .with_idle_backoff(Duration::from_millis(10));
    let scheduler = Scheduler::new(config, store.clone(), backend.clone(), sender.clone());
    scheduler.start().await.unwrap();

    let story = StoryRequest::new("user-1", Priority::Premium, "p1\n\np2", "http://submitter/cb")
        .with_story_id("story-42");
    scheduler.submit_story(story).await.unwrap();

    let callbacks = sender.wait_for(6, Duration::from_secs(5)).await;
    assert_eq!(callbacks.len(), 6);
    assert!(callbacks.iter().all(|(url, _)| url == "http://submitter/cb"));
    assert!(callbacks.iter().all(|(_, p)| p.status == "completed"));

    let batches = backend.batches.lock().unwrap().clone();
    let total: usize = batches.iter().map(|b| b.len()).sum();
    assert_eq!(total, 6);
    for batch in &batches {
        assert!(batch.len() <= 10);
        assert_eq!(batch.queue_key.priority, Priority::Premium);
        assert!(batch.tasks.iter().all(|t| t.queue_key() == batch.queue_key));
        assert!(batch.tasks.iter().all(|t| t.story_id == "story-42"));
    }
    // Two scenes, so every task type saw exactly two tasks.
    for task_type in TaskType::ALL {
        let count: usize = batches
            .iter()
            .filter(|b| b.queue_key.task_type == task_type)
            .map(|b| b.len())
            .sum();
        assert_eq!(count, 2, "unexpected task count for {}", task_type);
    }

    scheduler.shutdown(Duration::from_secs(5)).await;
    assert_eq!(scheduler.pool().active_count(), 0);
}

#[tokio::test]
async fn test_unavailable_backend_fails_every_task_and_dead_letters_the_batch() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
    let queue = PriorityTaskQueue::new(store.clone());
    let backend = Arc::new(BrokenBackend::default());
    let sender = Arc::new(RecordingSender::default());

    let callbacks = Arc::new(CallbackDelivery::new(
        sender.clone(),
        queue.clone(),
        3,
        Duration::from_millis(5),
    ));
    let dispatcher = Dispatcher::new(
        backend.clone(),
        queue.clone(),
        callbacks,
        DispatchPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        },
    );

    let key = QueueKey::new(TaskType::Clip, Priority::Free);
    let tasks: Vec<TaskRecord> = (0..4).map(|i| task(key, i)).collect();
    let batch = Batch::new(key, tasks, 10).unwrap();

    let result = dispatcher.dispatch(&batch).await;

    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.attempts, 3);
    assert!(result.dead_lettered);
    assert_eq!(result.failed(), 4);
    assert!(result
        .outcomes
        .iter()
        .all(|(_, o)| *o == TaskOutcome::Failed(BACKEND_UNAVAILABLE.to_string())));

    assert_eq!(store.len(BATCH_DEAD_LETTER_QUEUE).await.unwrap(), 1);
    let entries = store.range(BATCH_DEAD_LETTER_QUEUE, 1).await.unwrap();
    let entry: serde_json::Value = serde_json::from_str(&entries[0]).unwrap();
    assert_eq!(entry["batch"]["batch_id"], batch.batch_id.to_string());

    let received = sender.wait_for(4, Duration::from_secs(2)).await;
    assert_eq!(received.len(), 4);
    assert!(received.iter().all(|(_, p)| p.status == "failed"));
    assert!(!received.iter().any(|(_, p)| p.status == "completed"));
}

#[tokio::test]
async fn test_gate_limits_concurrent_batches() {
    let gate = AdmissionGate::new(1, Default::default());

    let first = gate.acquire(Priority::Free).await;
    let blocked = tokio::time::timeout(Duration::from_millis(50), gate.acquire(Priority::Premium)).await;
    assert!(blocked.is_err());

    drop(first);
    let second = tokio::time::timeout(Duration::from_secs(1), gate.acquire(Priority::Premium)).await;
    assert!(second.is_ok());
}
