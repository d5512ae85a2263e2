//! Priority task queues and the story admission queue.
//!
//! Both queues are thin typed layers over a [`QueueStore`]:
//!
//! - [`PriorityTaskQueue`]: one FIFO list per [`QueueKey`] holding JSON
//!   [`TaskRecord`]s, drained by the batch assemblers
//! - [`StoryQueue`]: two FIFO lists (`story_queue:paid`, `story_queue:free`)
//!   holding [`StoryRequest`]s, drained by the worker pool
//!
//! # Auxiliary lists
//!
//! - `batches:dead_letter`: batches that exhausted dispatch retries
//! - `story_queue:dead_letter`: stories that could not be decomposed
//! - `story_queue:incomplete`: markers for stories whose subtasks could not
//!   be rolled back after a partial enqueue
//! - `callbacks:undelivered`: callbacks that exhausted delivery attempts
//!
//! Nothing is replayed from these lists automatically.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::task::{Batch, Priority, QueueKey, StoryRequest, TaskRecord};
use crate::error::QueueError;
use crate::store::QueueStore;

/// Dead-letter list for batches.
pub const BATCH_DEAD_LETTER_QUEUE: &str = "batches:dead_letter";
/// Dead-letter list for stories.
pub const STORY_DEAD_LETTER_QUEUE: &str = "story_queue:dead_letter";
/// Incomplete-story markers awaiting reconciliation.
pub const INCOMPLETE_STORY_QUEUE: &str = "story_queue:incomplete";
/// Permanently undelivered callbacks.
pub const UNDELIVERED_CALLBACK_QUEUE: &str = "callbacks:undelivered";

/// Terminal lists that an operator can inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterKind {
    Batches,
    Stories,
    Incomplete,
    Callbacks,
}

impl DeadLetterKind {
    pub fn queue_name(&self) -> &'static str {
        match self {
            DeadLetterKind::Batches => BATCH_DEAD_LETTER_QUEUE,
            DeadLetterKind::Stories => STORY_DEAD_LETTER_QUEUE,
            DeadLetterKind::Incomplete => INCOMPLETE_STORY_QUEUE,
            DeadLetterKind::Callbacks => UNDELIVERED_CALLBACK_QUEUE,
        }
    }
}

impl std::str::FromStr for DeadLetterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batches" => Ok(DeadLetterKind::Batches),
            "stories" => Ok(DeadLetterKind::Stories),
            "incomplete" => Ok(DeadLetterKind::Incomplete),
            "callbacks" => Ok(DeadLetterKind::Callbacks),
            other => Err(format!(
                "unknown dead-letter list '{}' (expected batches, stories, incomplete or callbacks)",
                other
            )),
        }
    }
}

/// Peeks at a terminal list without removing anything, newest entry first.
///
/// Entries that are not valid JSON are returned as JSON strings.
pub async fn peek_dead_letters(
    store: &dyn QueueStore,
    kind: DeadLetterKind,
    limit: usize,
) -> Result<Vec<serde_json::Value>, QueueError> {
    let data = store.range(kind.queue_name(), limit).await?;
    Ok(data
        .into_iter()
        .map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)))
        .collect())
}

/// Marker for a story whose subtasks could not all be rolled back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncompleteStory {
    pub story_id: String,
    pub request_id: Uuid,
    /// Subtasks that may still be queued or in flight.
    pub orphaned_task_ids: Vec<Uuid>,
    pub reason: String,
    pub marked_at: DateTime<Utc>,
}

/// FIFO task queues, one per queue key.
#[derive(Clone)]
pub struct PriorityTaskQueue {
    store: Arc<dyn QueueStore>,
}

impl PriorityTaskQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Enqueues a task under the key formed by its type and priority.
    ///
    /// Stamps `created_at` when absent and returns the record exactly as
    /// stored, which is what [`remove`](Self::remove) needs to find it again.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the store rejects the push.
    pub async fn enqueue(&self, mut task: TaskRecord) -> Result<TaskRecord, QueueError> {
        if task.created_at.is_none() {
            task.created_at = Some(Utc::now());
        }
        let serialized = serde_json::to_string(&task)?;
        self.store
            .push(&task.queue_key().queue_name(), serialized)
            .await?;
        Ok(task)
    }

    /// Pops the oldest task of `key` without waiting.
    ///
    /// Records that fail to parse are logged and skipped.
    pub async fn dequeue_one(&self, key: QueueKey) -> Result<Option<TaskRecord>, QueueError> {
        let queue_name = key.queue_name();
        loop {
            let Some(data) = self.store.pop(&queue_name).await? else {
                return Ok(None);
            };
            match serde_json::from_str::<TaskRecord>(&data) {
                Ok(task) => return Ok(Some(task)),
                Err(e) => {
                    warn!(queue = %queue_name, error = %e, "Dropping malformed task record");
                }
            }
        }
    }

    /// Number of tasks waiting under `key`.
    pub async fn length(&self, key: QueueKey) -> Result<usize, QueueError> {
        self.store.len(&key.queue_name()).await
    }

    /// Lengths of every task queue, keyed by queue name.
    pub async fn lengths(&self) -> Result<BTreeMap<String, usize>, QueueError> {
        let mut lengths = BTreeMap::new();
        for key in QueueKey::all() {
            lengths.insert(key.queue_name(), self.length(key).await?);
        }
        Ok(lengths)
    }

    /// Removes a previously enqueued task, as returned by [`enqueue`](Self::enqueue).
    ///
    /// Returns false if the task is no longer queued (already claimed by an
    /// assembler, or never stored).
    pub async fn remove(&self, task: &TaskRecord) -> Result<bool, QueueError> {
        let serialized = serde_json::to_string(task)?;
        let removed = self
            .store
            .remove(&task.queue_key().queue_name(), &serialized)
            .await?;
        Ok(removed > 0)
    }

    /// Moves a batch to the dead-letter list.
    pub async fn dead_letter_batch(&self, batch: &Batch, error: &str) -> Result<(), QueueError> {
        let entry = serde_json::json!({
            "batch": batch,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        self.store
            .push(BATCH_DEAD_LETTER_QUEUE, serde_json::to_string(&entry)?)
            .await
    }

    /// Records a callback that exhausted its delivery attempts.
    pub async fn record_undelivered(
        &self,
        task: &TaskRecord,
        status: &str,
        error: &str,
    ) -> Result<(), QueueError> {
        let entry = serde_json::json!({
            "task_id": task.task_id,
            "story_id": task.story_id,
            "callback_url": task.callback_url,
            "status": status,
            "error": error,
            "recorded_at": Utc::now().to_rfc3339(),
        });
        self.store
            .push(UNDELIVERED_CALLBACK_QUEUE, serde_json::to_string(&entry)?)
            .await
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }
}

/// Two-class story admission queue.
#[derive(Clone)]
pub struct StoryQueue {
    store: Arc<dyn QueueStore>,
}

impl StoryQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    fn queue_name(priority: Priority) -> String {
        format!("story_queue:{}", priority.admission_name())
    }

    /// Adds a story to the list of its class.
    pub async fn enqueue_story(&self, story: &StoryRequest) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(story)?;
        self.store
            .push(&Self::queue_name(story.priority), serialized)
            .await
    }

    /// Pops the next story, paid before free.
    ///
    /// Malformed entries are logged and skipped.
    pub async fn next_story(&self) -> Result<Option<StoryRequest>, QueueError> {
        for priority in Priority::ALL {
            let queue_name = Self::queue_name(priority);
            while let Some(data) = self.store.pop(&queue_name).await? {
                match serde_json::from_str::<StoryRequest>(&data) {
                    Ok(story) => return Ok(Some(story)),
                    Err(e) => {
                        warn!(queue = %queue_name, error = %e, "Dropping malformed story request");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Puts a story back for another decomposition attempt.
    pub async fn requeue(&self, story: &StoryRequest) -> Result<(), QueueError> {
        self.enqueue_story(story).await
    }

    /// Moves a story to the story dead-letter list.
    pub async fn dead_letter(&self, story: &StoryRequest, error: &str) -> Result<(), QueueError> {
        let entry = serde_json::json!({
            "story": story,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        self.store
            .push(STORY_DEAD_LETTER_QUEUE, serde_json::to_string(&entry)?)
            .await
    }

    /// Records an incomplete-story marker for reconciliation.
    pub async fn mark_incomplete(&self, marker: &IncompleteStory) -> Result<(), QueueError> {
        self.store
            .push(INCOMPLETE_STORY_QUEUE, serde_json::to_string(marker)?)
            .await
    }

    /// Lengths of the two admission lists, keyed `paid` and `free`.
    pub async fn lengths(&self) -> Result<BTreeMap<String, usize>, QueueError> {
        let mut lengths = BTreeMap::new();
        for priority in Priority::ALL {
            let len = self.store.len(&Self::queue_name(priority)).await?;
            lengths.insert(priority.admission_name().to_string(), len);
        }
        Ok(lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskType;
    use crate::store::MemoryStore;

    fn task(key: QueueKey, prompt: &str) -> TaskRecord {
        TaskRecord {
            task_id: Uuid::new_v4(),
            task_type: key.task_type,
            priority: key.priority,
            story_id: "story-1".to_string(),
            user_id: "u1".to_string(),
            scene_index: 0,
            prompt: prompt.to_string(),
            callback_url: "http://localhost/cb".to_string(),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_stamps_created_at_and_keeps_fifo() {
        let store = Arc::new(MemoryStore::new());
        let queue = PriorityTaskQueue::new(store.clone());
        let key = QueueKey::new(TaskType::Scene, Priority::Premium);

        let first = queue.enqueue(task(key, "first")).await.unwrap();
        queue.enqueue(task(key, "second")).await.unwrap();
        assert!(first.created_at.is_some());
        assert_eq!(queue.length(key).await.unwrap(), 2);

        let popped = queue.dequeue_one(key).await.unwrap().unwrap();
        assert_eq!(popped.prompt, "first");
        assert_eq!(popped, first);
        let popped = queue.dequeue_one(key).await.unwrap().unwrap();
        assert_eq!(popped.prompt, "second");
        assert!(queue.dequeue_one(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_preserves_existing_timestamp() {
        let queue = PriorityTaskQueue::new(Arc::new(MemoryStore::new()));
        let key = QueueKey::new(TaskType::Clip, Priority::Free);
        let stamp = Utc::now() - chrono::Duration::minutes(5);
        let mut record = task(key, "old");
        record.created_at = Some(stamp);

        let stored = queue.enqueue(record).await.unwrap();
        assert_eq!(stored.created_at, Some(stamp));
    }

    #[tokio::test]
    async fn test_keys_do_not_share_lists() {
        let queue = PriorityTaskQueue::new(Arc::new(MemoryStore::new()));
        let premium = QueueKey::new(TaskType::Character, Priority::Premium);
        let free = QueueKey::new(TaskType::Character, Priority::Free);

        queue.enqueue(task(premium, "p")).await.unwrap();
        assert!(queue.dequeue_one(free).await.unwrap().is_none());

        let lengths = queue.lengths().await.unwrap();
        assert_eq!(lengths.len(), 6);
        assert_eq!(lengths["char_queue:premium"], 1);
        assert_eq!(lengths["char_queue:free"], 0);
    }

    #[tokio::test]
    async fn test_remove_stored_task() {
        let queue = PriorityTaskQueue::new(Arc::new(MemoryStore::new()));
        let key = QueueKey::new(TaskType::Scene, Priority::Free);
        let stored = queue.enqueue(task(key, "x")).await.unwrap();

        assert!(queue.remove(&stored).await.unwrap());
        assert!(!queue.remove(&stored).await.unwrap());
        assert_eq!(queue.length(key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let queue = PriorityTaskQueue::new(store.clone());
        let key = QueueKey::new(TaskType::Scene, Priority::Free);

        store
            .push(&key.queue_name(), "not json".to_string())
            .await
            .unwrap();
        queue.enqueue(task(key, "valid")).await.unwrap();

        let popped = queue.dequeue_one(key).await.unwrap().unwrap();
        assert_eq!(popped.prompt, "valid");
    }

    #[tokio::test]
    async fn test_story_queue_prefers_paid() {
        let queue = StoryQueue::new(Arc::new(MemoryStore::new()));
        let free = StoryRequest::new("u1", Priority::Free, "free story", "http://cb");
        let paid = StoryRequest::new("u2", Priority::Premium, "paid story", "http://cb");

        queue.enqueue_story(&free).await.unwrap();
        queue.enqueue_story(&paid).await.unwrap();

        let lengths = queue.lengths().await.unwrap();
        assert_eq!(lengths["paid"], 1);
        assert_eq!(lengths["free"], 1);

        assert_eq!(queue.next_story().await.unwrap().unwrap(), paid);
        assert_eq!(queue.next_story().await.unwrap().unwrap(), free);
        assert!(queue.next_story().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_entries_are_inspectable() {
        let store = Arc::new(MemoryStore::new());
        let stories = StoryQueue::new(store.clone());
        let story = StoryRequest::new("u1", Priority::Free, "", "http://cb");

        stories.dead_letter(&story, "no scenes").await.unwrap();

        let entries = peek_dead_letters(store.as_ref(), DeadLetterKind::Stories, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["error"], "no scenes");
        assert!(entries[0].get("moved_at").is_some());
        assert_eq!(
            entries[0]["story"]["request_id"],
            serde_json::json!(story.request_id)
        );
    }

    #[test]
    fn test_dead_letter_kind_parse() {
        assert_eq!(
            "incomplete".parse::<DeadLetterKind>().unwrap(),
            DeadLetterKind::Incomplete
        );
        assert!("everything".parse::<DeadLetterKind>().is_err());
        assert_eq!(DeadLetterKind::Batches.queue_name(), "batches:dead_letter");
    }
}
