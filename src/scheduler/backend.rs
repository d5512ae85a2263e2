//! Downstream compute backend client.
//!
//! The backend exposes two endpoints:
//!
//! - `POST /process_batch` with `{batch_id, tasks, timestamp}`, answering
//!   `{task_results: [...]}` aligned positionally with `tasks`
//! - `GET /health`, answering 200 when the service can take work

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{Batch, TaskRecord};
use crate::error::BackendError;

/// Body of a `/process_batch` call.
#[derive(Debug, Serialize)]
pub struct BatchRequest<'a> {
    pub batch_id: Uuid,
    pub tasks: &'a [TaskRecord],
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl<'a> BatchRequest<'a> {
    pub fn from_batch(batch: &'a Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            tasks: &batch.tasks,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Body of a successful `/process_batch` answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub task_results: Vec<serde_json::Value>,
}

/// A service that executes batches.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Runs one batch. Any error is a batch-level failure.
    async fn process_batch(&self, batch: &Batch) -> Result<BatchResponse, BackendError>;

    /// Whether the backend is currently able to take work.
    async fn health(&self) -> bool;
}

/// HTTP client for the compute backend.
pub struct HttpComputeBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpComputeBackend {
    /// Creates a client for the backend at `base_url`.
    ///
    /// `timeout` bounds each request, including reading the response body.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Transport` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }
}

#[async_trait]
impl ComputeBackend for HttpComputeBackend {
    async fn process_batch(&self, batch: &Batch) -> Result<BatchResponse, BackendError> {
        let url = format!("{}/process_batch", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .json(&BatchRequest::from_batch(batch))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(BackendError::Status {
                code: status.as_u16(),
                body,
            });
        }

        response
            .json::<BatchResponse>()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.authorize(self.client.get(&url)).send().await {
            Ok(response) => response.status().as_u16() == 200,
            Err(e) => {
                tracing::warn!(error = %e, "Compute backend health check failed");
                false
            }
        }
    }
}
