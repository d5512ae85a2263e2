//! Record types for the scheduler.
//!
//! This module defines the data that flows through the scheduling system:
//!
//! - `StoryRequest`: a submitted story waiting in the admission queue
//! - `TaskRecord`: one typed subtask waiting in a priority task queue
//! - `QueueKey`: the (task type, priority) pair addressing one task queue
//! - `Batch`: a bounded group of tasks dispatched together
//! - `BatchResult` / `TaskOutcome`: per-task resolution of a dispatched batch

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Kind of generation work a subtask asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Character,
    Scene,
    Clip,
}

impl TaskType {
    /// All task types, in decomposition order.
    pub const ALL: [TaskType; 3] = [TaskType::Character, TaskType::Scene, TaskType::Clip];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Character => "character",
            TaskType::Scene => "scene",
            TaskType::Clip => "clip",
        }
    }

    fn queue_prefix(&self) -> &'static str {
        match self {
            TaskType::Character => "char_queue",
            TaskType::Scene => "scene_queue",
            TaskType::Clip => "clip_queue",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service class of a story and of every subtask split from it.
///
/// Submitters may say `paid` or `premium`; both mean the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[serde(alias = "paid")]
    Premium,
    Free,
}

impl Priority {
    /// Premium before free.
    pub const ALL: [Priority; 2] = [Priority::Premium, Priority::Free];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Premium => "premium",
            Priority::Free => "free",
        }
    }

    /// Name of this class in the story admission queue.
    pub fn admission_name(&self) -> &'static str {
        match self {
            Priority::Premium => "paid",
            Priority::Free => "free",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "premium" | "paid" => Ok(Priority::Premium),
            "free" => Ok(Priority::Free),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Address of one logical task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub task_type: TaskType,
    pub priority: Priority,
}

impl QueueKey {
    pub fn new(task_type: TaskType, priority: Priority) -> Self {
        Self {
            task_type,
            priority,
        }
    }

    /// Every queue key, premium keys of a task type before its free key.
    pub fn all() -> Vec<QueueKey> {
        TaskType::ALL
            .iter()
            .flat_map(|task_type| {
                Priority::ALL
                    .iter()
                    .map(move |priority| QueueKey::new(*task_type, *priority))
            })
            .collect()
    }

    /// Name of the store list backing this key, e.g. `char_queue:premium`.
    pub fn queue_name(&self) -> String {
        format!("{}:{}", self.task_type.queue_prefix(), self.priority)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task_type, self.priority)
    }
}

/// A submitted story waiting for decomposition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryRequest {
    pub request_id: Uuid,
    pub user_id: String,
    pub priority: Priority,
    /// Caller-chosen story id; one is generated at decomposition when absent.
    #[serde(default)]
    pub story_id: Option<String>,
    pub prompt_content: String,
    pub callback_url: String,
    pub submitted_at: DateTime<Utc>,
    /// Decomposition attempts already made for this story.
    #[serde(default)]
    pub attempts: u32,
}

impl StoryRequest {
    pub fn new(
        user_id: impl Into<String>,
        priority: Priority,
        prompt_content: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id: user_id.into(),
            priority,
            story_id: None,
            prompt_content: prompt_content.into(),
            callback_url: callback_url.into(),
            submitted_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Sets the story id.
    pub fn with_story_id(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }
}

/// One typed subtask of a story.
///
/// Records are never mutated after creation except for the `created_at`
/// stamp applied on first enqueue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub priority: Priority,
    pub story_id: String,
    pub user_id: String,
    pub scene_index: usize,
    pub prompt: String,
    pub callback_url: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(self.task_type, self.priority)
    }
}

/// Reasons a batch cannot be built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch must contain at least one task")]
    Empty,

    #[error("Batch holds {len} tasks, limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Task {task_id} belongs to {found}, batch is for {expected}")]
    MixedQueueKey {
        task_id: Uuid,
        expected: QueueKey,
        found: QueueKey,
    },
}

/// A bounded group of same-key tasks dispatched together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub queue_key: QueueKey,
    pub tasks: Vec<TaskRecord>,
    pub assembled_at: DateTime<Utc>,
}

impl Batch {
    /// Builds a batch, enforcing `1 <= tasks.len() <= max_batch_size` and a
    /// single queue key.
    pub fn new(
        queue_key: QueueKey,
        tasks: Vec<TaskRecord>,
        max_batch_size: usize,
    ) -> Result<Self, BatchError> {
        if tasks.is_empty() {
            return Err(BatchError::Empty);
        }
        if tasks.len() > max_batch_size {
            return Err(BatchError::TooLarge {
                len: tasks.len(),
                max: max_batch_size,
            });
        }
        if let Some(stray) = tasks.iter().find(|t| t.queue_key() != queue_key) {
            return Err(BatchError::MixedQueueKey {
                task_id: stray.task_id,
                expected: queue_key,
                found: stray.queue_key(),
            });
        }

        Ok(Self {
            batch_id: Uuid::new_v4(),
            queue_key,
            tasks,
            assembled_at: Utc::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Resolution of one task inside a dispatched batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }

    /// Status string sent to the submitter's callback.
    pub fn callback_status(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded(_) => "completed",
            TaskOutcome::Failed(_) => "failed",
        }
    }
}

/// Per-task resolution of a dispatched batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub queue_key: QueueKey,
    /// One outcome per task, in batch order.
    pub outcomes: Vec<(Uuid, TaskOutcome)>,
    /// Backend attempts made for this batch.
    pub attempts: u32,
    /// Whether the batch was moved to the dead-letter list.
    pub dead_lettered: bool,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}
