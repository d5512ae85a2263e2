//! Story decomposition into typed subtasks.
//!
//! A story's content is split into scenes on blank lines. Every scene yields
//! three subtasks, in order: a character, a scene and a clip task. All
//! subtasks inherit the story's priority and callback URL.
//!
//! Enqueueing is all-or-nothing from the caller's point of view. If a push
//! fails part-way, the subtasks already enqueued are removed again. When a
//! removal fails, or an assembler already claimed one of them, an
//! [`IncompleteStory`] marker is written instead so the orphans can be
//! reconciled.

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::queue::{IncompleteStory, PriorityTaskQueue, StoryQueue};
use super::task::{StoryRequest, TaskRecord, TaskType};
use crate::error::{DecompositionError, QueueError};

/// Characters of a scene quoted in each subtask prompt.
const PROMPT_EXCERPT_CHARS: usize = 100;

/// Subtasks enqueued for one story.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub story_id: String,
    /// In enqueue order.
    pub task_ids: Vec<Uuid>,
}

/// Splits stories and enqueues their subtasks.
#[derive(Clone)]
pub struct TaskSplitter {
    queue: PriorityTaskQueue,
    stories: StoryQueue,
}

impl TaskSplitter {
    pub fn new(queue: PriorityTaskQueue, stories: StoryQueue) -> Self {
        Self { queue, stories }
    }

    /// Decomposes `story` and enqueues every subtask.
    ///
    /// # Errors
    ///
    /// - `DecompositionError::NoScenes` if the content has no non-blank paragraph
    /// - `DecompositionError::EnqueueFailed` if a push failed; see
    ///   [`DecompositionError::is_retryable`] for whether the story left traces
    pub async fn decompose(
        &self,
        story: &StoryRequest,
    ) -> Result<Decomposition, DecompositionError> {
        let story_id = story
            .story_id
            .clone()
            .unwrap_or_else(|| story.request_id.to_string());

        let scenes = split_scenes(&story.prompt_content);
        if scenes.is_empty() {
            return Err(DecompositionError::NoScenes { story_id });
        }

        let tasks = build_tasks(story, &story_id, &scenes);
        let mut enqueued: Vec<TaskRecord> = Vec::with_capacity(tasks.len());

        for task in tasks {
            match self.queue.enqueue(task).await {
                Ok(stored) => enqueued.push(stored),
                Err(source) => {
                    return Err(self.compensate(story, story_id, enqueued, source).await);
                }
            }
        }

        info!(
            story_id = %story_id,
            request_id = %story.request_id,
            scenes = scenes.len(),
            subtasks = enqueued.len(),
            priority = %story.priority,
            "Story decomposed"
        );

        Ok(Decomposition {
            story_id,
            task_ids: enqueued.iter().map(|t| t.task_id).collect(),
        })
    }

    /// Undoes a partial enqueue, or marks the story incomplete if that fails.
    async fn compensate(
        &self,
        story: &StoryRequest,
        story_id: String,
        enqueued: Vec<TaskRecord>,
        source: QueueError,
    ) -> DecompositionError {
        warn!(
            story_id = %story_id,
            enqueued = enqueued.len(),
            error = %source,
            "Subtask enqueue failed, rolling back"
        );

        let mut orphaned = Vec::new();
        for task in enqueued.iter().rev() {
            match self.queue.remove(task).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(story_id = %story_id, task_id = %task.task_id, "Subtask already claimed");
                    orphaned.push(task.task_id);
                }
                Err(e) => {
                    warn!(story_id = %story_id, task_id = %task.task_id, error = %e, "Rollback removal failed");
                    orphaned.push(task.task_id);
                }
            }
        }

        if orphaned.is_empty() {
            return DecompositionError::EnqueueFailed {
                story_id,
                enqueued: enqueued.len(),
                rolled_back: true,
                marker_written: false,
                source,
            };
        }

        let marker = IncompleteStory {
            story_id: story_id.clone(),
            request_id: story.request_id,
            orphaned_task_ids: orphaned,
            reason: source.to_string(),
            marked_at: Utc::now(),
        };
        let marker_written = match self.stories.mark_incomplete(&marker).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    story_id = %story_id,
                    orphaned = ?marker.orphaned_task_ids,
                    error = %e,
                    "Failed to write incomplete-story marker"
                );
                false
            }
        };

        DecompositionError::EnqueueFailed {
            story_id,
            enqueued: enqueued.len(),
            rolled_back: false,
            marker_written,
            source,
        }
    }
}

/// Non-blank paragraphs of `content`, trimmed.
pub fn split_scenes(content: &str) -> Vec<&str> {
    content
        .split("\n\n")
        .map(str::trim)
        .filter(|scene| !scene.is_empty())
        .collect()
}

fn build_tasks(story: &StoryRequest, story_id: &str, scenes: &[&str]) -> Vec<TaskRecord> {
    let mut tasks = Vec::with_capacity(scenes.len() * TaskType::ALL.len());
    for (scene_index, scene) in scenes.iter().enumerate() {
        let excerpt: String = scene.chars().take(PROMPT_EXCERPT_CHARS).collect();
        for task_type in TaskType::ALL {
            let prompt = match task_type {
                TaskType::Character => format!("Generate character for: {}...", excerpt),
                TaskType::Scene => format!("Generate scene for: {}...", excerpt),
                TaskType::Clip => format!("Animate scene: {}...", excerpt),
            };
            tasks.push(TaskRecord {
                task_id: Uuid::new_v4(),
                task_type,
                priority: story.priority,
                story_id: story_id.to_string(),
                user_id: story.user_id.clone(),
                scene_index,
                prompt,
                callback_url: story.callback_url.clone(),
                created_at: None,
            });
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::queue::{peek_dead_letters, DeadLetterKind};
    use crate::scheduler::task::{Priority, QueueKey};
    use crate::store::{MemoryStore, QueueStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Memory store that fails the Nth task push and, optionally, every removal.
    struct FlakyStore {
        inner: MemoryStore,
        fail_task_push_at: usize,
        fail_removes: bool,
        task_pushes: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_task_push_at: usize, fail_removes: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_task_push_at,
                fail_removes,
                task_pushes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QueueStore for FlakyStore {
        async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
            if !queue.starts_with("story_queue") {
                let n = self.task_pushes.fetch_add(1, Ordering::SeqCst) + 1;
                if n == self.fail_task_push_at {
                    return Err(QueueError::StoreUnavailable("connection reset".to_string()));
                }
            }
            self.inner.push(queue, payload).await
        }

        async fn pop(&self, queue: &str) -> Result<Option<String>, QueueError> {
            self.inner.pop(queue).await
        }

        async fn len(&self, queue: &str) -> Result<usize, QueueError> {
            self.inner.len(queue).await
        }

        async fn remove(&self, queue: &str, payload: &str) -> Result<usize, QueueError> {
            if self.fail_removes {
                return Err(QueueError::StoreUnavailable("connection reset".to_string()));
            }
            self.inner.remove(queue, payload).await
        }

        async fn range(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError> {
            self.inner.range(queue, limit).await
        }

        async fn ping(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn splitter(store: Arc<dyn QueueStore>) -> (TaskSplitter, PriorityTaskQueue) {
        let queue = PriorityTaskQueue::new(store.clone());
        (
            TaskSplitter::new(queue.clone(), StoryQueue::new(store)),
            queue,
        )
    }

    async fn total_tasks(queue: &PriorityTaskQueue) -> usize {
        queue.lengths().await.unwrap().values().sum()
    }

    #[test]
    fn test_split_scenes_skips_blank_paragraphs() {
        let scenes = split_scenes("  first  \n\n\n\n   \n\nsecond\nline\n\n");
        assert_eq!(scenes, vec!["first", "second\nline"]);
        assert!(split_scenes("\n\n   \n\n").is_empty());
    }

    #[tokio::test]
    async fn test_two_scenes_yield_six_ordered_subtasks() {
        let store = Arc::new(MemoryStore::new());
        let (splitter, queue) = splitter(store.clone());
        let story = StoryRequest::new("u1", Priority::Premium, "p1\n\np2", "http://cb")
            .with_story_id("story-42");

        let result = splitter.decompose(&story).await.unwrap();
        assert_eq!(result.story_id, "story-42");
        assert_eq!(result.task_ids.len(), 6);

        for task_type in TaskType::ALL {
            let key = QueueKey::new(task_type, Priority::Premium);
            assert_eq!(queue.length(key).await.unwrap(), 2);
            assert_eq!(
                queue
                    .length(QueueKey::new(task_type, Priority::Free))
                    .await
                    .unwrap(),
                0
            );
        }

        let character = queue
            .dequeue_one(QueueKey::new(TaskType::Character, Priority::Premium))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(character.task_id, result.task_ids[0]);
        assert_eq!(character.prompt, "Generate character for: p1...");
        assert_eq!(character.callback_url, "http://cb");

        let clip = queue
            .dequeue_one(QueueKey::new(TaskType::Clip, Priority::Premium))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clip.prompt, "Animate scene: p1...");
        assert_eq!(clip.scene_index, 0);
    }

    #[tokio::test]
    async fn test_prompt_excerpt_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let (splitter, queue) = splitter(store);
        let long_scene = "é".repeat(250);
        let story = StoryRequest::new("u1", Priority::Free, long_scene, "http://cb");

        let result = splitter.decompose(&story).await.unwrap();
        assert_eq!(result.story_id, story.request_id.to_string());

        let task = queue
            .dequeue_one(QueueKey::new(TaskType::Scene, Priority::Free))
            .await
            .unwrap()
            .unwrap();
        let expected = format!("Generate scene for: {}...", "é".repeat(100));
        assert_eq!(task.prompt, expected);
    }

    #[tokio::test]
    async fn test_story_without_scenes_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (splitter, queue) = splitter(store);
        let story = StoryRequest::new("u1", Priority::Free, " \n\n \n\n", "http://cb");

        let err = splitter.decompose(&story).await.unwrap_err();
        assert!(matches!(err, DecompositionError::NoScenes { .. }));
        assert!(!err.is_retryable());
        assert_eq!(total_tasks(&queue).await, 0);
    }

    #[tokio::test]
    async fn test_failure_on_second_push_rolls_back() {
        let store = Arc::new(FlakyStore::new(2, false));
        let (splitter, queue) = splitter(store.clone());
        let story = StoryRequest::new("u1", Priority::Premium, "only scene", "http://cb");

        let err = splitter.decompose(&story).await.unwrap_err();
        match &err {
            DecompositionError::EnqueueFailed {
                enqueued,
                rolled_back,
                ..
            } => {
                assert_eq!(*enqueued, 1);
                assert!(*rolled_back);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());
        assert_eq!(total_tasks(&queue).await, 0);

        let markers = peek_dead_letters(store.as_ref(), DeadLetterKind::Incomplete, 10)
            .await
            .unwrap();
        assert!(markers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_writes_incomplete_marker() {
        let store = Arc::new(FlakyStore::new(2, true));
        let (splitter, queue) = splitter(store.clone());
        let story = StoryRequest::new("u1", Priority::Premium, "only scene", "http://cb");

        let err = splitter.decompose(&story).await.unwrap_err();
        match &err {
            DecompositionError::EnqueueFailed {
                rolled_back,
                marker_written,
                ..
            } => {
                assert!(!*rolled_back);
                assert!(*marker_written);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_retryable());
        assert_eq!(total_tasks(&queue).await, 1);

        let markers = peek_dead_letters(store.as_ref(), DeadLetterKind::Incomplete, 10)
            .await
            .unwrap();
        assert_eq!(markers.len(), 1);
        let marker: IncompleteStory = serde_json::from_value(markers[0].clone()).unwrap();
        assert_eq!(marker.request_id, story.request_id);
        assert_eq!(marker.orphaned_task_ids.len(), 1);
    }
}
