//! Error types for storee operations.
//!
//! Defines the error taxonomy shared by the scheduling subsystems:
//! - Queue store access (task queues and the story admission queue)
//! - Story decomposition into subtasks
//! - Downstream compute backend calls
//! - Callback delivery to submitters

use thiserror::Error;

/// Errors raised by queue store access.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying queue store could not be reached or rejected the command.
    #[error("Queue store unavailable: {0}")]
    StoreUnavailable(String),

    /// A record could not be serialized for storage.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::StoreUnavailable(err.to_string())
    }
}

/// Errors raised while splitting a story into subtasks.
#[derive(Debug, Error)]
pub enum DecompositionError {
    /// The story content contains no usable scene.
    #[error("Story '{story_id}' contains no scenes")]
    NoScenes { story_id: String },

    /// A subtask enqueue failed part-way through the story.
    ///
    /// `rolled_back` is true when every subtask enqueued before the failure
    /// was removed again. When false, an incomplete-story marker was written
    /// (or `marker_written` is false and the story needs reconciliation).
    #[error(
        "Enqueue failed for story '{story_id}' after {enqueued} subtasks (rolled_back={rolled_back}): {source}"
    )]
    EnqueueFailed {
        story_id: String,
        enqueued: usize,
        rolled_back: bool,
        marker_written: bool,
        #[source]
        source: QueueError,
    },
}

impl DecompositionError {
    /// Whether the story can be safely retried from scratch.
    ///
    /// Only a fully rolled back enqueue failure leaves no trace of the story
    /// in the task queues.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DecompositionError::EnqueueFailed {
                rolled_back: true,
                ..
            }
        )
    }
}

/// Errors raised by the downstream compute backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request never produced an HTTP response (connect, timeout, TLS).
    #[error("Backend request failed: {0}")]
    Transport(String),

    /// The backend answered with a non-2xx status.
    #[error("Backend returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    /// The backend answered 2xx with a body that does not match the contract.
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

/// Errors raised while delivering a completion callback.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The callback endpoint could not be reached.
    #[error("Callback request failed: {0}")]
    Transport(String),

    /// The callback endpoint answered with a non-2xx status.
    #[error("Callback returned HTTP {code}")]
    Status { code: u16 },
}
