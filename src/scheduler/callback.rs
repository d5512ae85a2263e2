//! Completion callbacks to story submitters.
//!
//! Every task of a resolved batch produces one `POST <callback_url>` with
//! `{task_id, status, result, timestamp}`. Delivery is retried with
//! exponential backoff; a callback that exhausts its attempts is recorded in
//! `callbacks:undelivered` and counted, never dropped silently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::dispatcher::backoff_delay;
use super::queue::PriorityTaskQueue;
use super::task::{TaskOutcome, TaskRecord};
use crate::error::DeliveryError;
use crate::metrics::MetricsCollector;

/// Upper bound for the delay between two delivery attempts.
const MAX_CALLBACK_BACKOFF: Duration = Duration::from_secs(30);

/// Body of a completion callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub task_id: Uuid,
    /// `completed` or `failed`.
    pub status: String,
    pub result: serde_json::Value,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl CallbackPayload {
    pub fn new(task: &TaskRecord, outcome: &TaskOutcome) -> Self {
        let result = match outcome {
            TaskOutcome::Succeeded(value) => value.clone(),
            TaskOutcome::Failed(reason) => serde_json::json!({ "error": reason }),
        };
        Self {
            task_id: task.task_id,
            status: outcome.callback_status().to_string(),
            result,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Transport for callbacks.
#[async_trait]
pub trait CallbackSender: Send + Sync {
    /// Sends one callback. Succeeds only on a 2xx answer.
    async fn send(&self, url: &str, payload: &CallbackPayload) -> Result<(), DeliveryError>;
}

/// Callback transport over HTTP.
pub struct HttpCallbackSender {
    client: Client,
}

impl HttpCallbackSender {
    /// Creates a sender whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Transport` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackSender for HttpCallbackSender {
    async fn send(&self, url: &str, payload: &CallbackPayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                code: status.as_u16(),
            })
        }
    }
}

/// Final state of one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Undelivered { attempts: u32, error: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Callback delivery with bounded retry.
pub struct CallbackDelivery {
    sender: Arc<dyn CallbackSender>,
    queue: PriorityTaskQueue,
    max_attempts: u32,
    backoff: Duration,
    metrics: MetricsCollector,
}

impl CallbackDelivery {
    pub fn new(
        sender: Arc<dyn CallbackSender>,
        queue: PriorityTaskQueue,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            sender,
            queue,
            max_attempts: max_attempts.max(1),
            backoff,
            metrics: MetricsCollector::new(),
        }
    }

    /// Notifies the submitter of `task` about `outcome`.
    pub async fn deliver(&self, task: &TaskRecord, outcome: &TaskOutcome) -> DeliveryOutcome {
        let payload = CallbackPayload::new(task, outcome);
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff_delay(self.backoff, attempt - 1, MAX_CALLBACK_BACKOFF))
                    .await;
            }

            match self.sender.send(&task.callback_url, &payload).await {
                Ok(()) => {
                    debug!(task_id = %task.task_id, attempt, status = %payload.status, "Callback delivered");
                    self.metrics.record_callback(true);
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(e) => {
                    warn!(
                        task_id = %task.task_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Callback delivery failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        error!(
            task_id = %task.task_id,
            callback_url = %task.callback_url,
            error = %last_error,
            "Callback permanently undelivered"
        );
        self.metrics.record_callback(false);
        if let Err(e) = self
            .queue
            .record_undelivered(task, &payload.status, &last_error)
            .await
        {
            error!(task_id = %task.task_id, error = %e, "Failed to record undelivered callback");
        }

        DeliveryOutcome::Undelivered {
            attempts: self.max_attempts,
            error: last_error,
        }
    }
}
