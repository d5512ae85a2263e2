//! Batch dispatch to the compute backend.
//!
//! The [`Dispatcher`] turns a batch into a [`BatchResult`] with one outcome
//! per task. Transport and backend errors retry the whole batch with
//! exponential backoff; once attempts are exhausted the batch is moved to
//! the dead-letter list and every task is reported
//! `failed(backend_unavailable)`. Callbacks are delivered on detached tasks
//! so a slow submitter never holds up the next batch.
//!
//! [`GatedDispatcher`] puts the weighted [`AdmissionGate`] in front of the
//! dispatcher and is what the assemblers hand their batches to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::assembler::BatchHandler;
use super::backend::{BatchResponse, ComputeBackend};
use super::callback::CallbackDelivery;
use super::gate::AdmissionGate;
use super::queue::PriorityTaskQueue;
use super::task::{Batch, BatchResult, TaskOutcome};
use crate::metrics::MetricsCollector;

/// Failure reason reported for every task of a dead-lettered batch.
pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";

/// Failure reason for a task the backend returned no result for.
pub const MISSING_RESULT: &str = "missing_result";

/// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
pub fn backoff_delay(base: Duration, retry: u32, cap: Duration) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    base.checked_mul(1u32 << exponent).unwrap_or(cap).min(cap)
}

/// Retry policy for batch dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    /// Total backend attempts per batch.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

/// Sends batches to the compute backend and resolves them per task.
pub struct Dispatcher {
    backend: Arc<dyn ComputeBackend>,
    queue: PriorityTaskQueue,
    callbacks: Arc<CallbackDelivery>,
    policy: DispatchPolicy,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        queue: PriorityTaskQueue,
        callbacks: Arc<CallbackDelivery>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            backend,
            queue,
            callbacks,
            policy,
            metrics: MetricsCollector::new(),
        }
    }

    /// Dispatches one batch and schedules its callbacks.
    pub async fn dispatch(&self, batch: &Batch) -> BatchResult {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        info!(
            batch_id = %batch.batch_id,
            queue = %batch.queue_key,
            tasks = batch.len(),
            "Dispatching batch"
        );

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = backoff_delay(self.policy.backoff, attempt - 1, self.policy.backoff_max);
                tokio::time::sleep(delay).await;
            }

            match self.backend.process_batch(batch).await {
                Ok(response) => {
                    let result = BatchResult {
                        batch_id: batch.batch_id,
                        queue_key: batch.queue_key,
                        outcomes: align_results(batch, &response),
                        attempts: attempt,
                        dead_lettered: false,
                    };
                    info!(
                        batch_id = %batch.batch_id,
                        queue = %batch.queue_key,
                        attempt,
                        succeeded = result.succeeded(),
                        failed = result.failed(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Batch completed"
                    );
                    self.finish(batch, &result, started.elapsed());
                    return result;
                }
                Err(e) => {
                    warn!(
                        batch_id = %batch.batch_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Batch dispatch failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        error!(
            batch_id = %batch.batch_id,
            queue = %batch.queue_key,
            error = %last_error,
            "Batch exhausted retries, moving to dead letter queue"
        );
        if let Err(e) = self.queue.dead_letter_batch(batch, &last_error).await {
            error!(batch_id = %batch.batch_id, error = %e, "Failed to dead-letter batch");
        }

        let result = BatchResult {
            batch_id: batch.batch_id,
            queue_key: batch.queue_key,
            outcomes: batch
                .tasks
                .iter()
                .map(|t| (t.task_id, TaskOutcome::Failed(BACKEND_UNAVAILABLE.to_string())))
                .collect(),
            attempts: max_attempts,
            dead_lettered: true,
        };
        self.finish(batch, &result, started.elapsed());
        result
    }

    /// Records metrics and spawns one callback per task.
    fn finish(&self, batch: &Batch, result: &BatchResult, elapsed: Duration) {
        self.metrics.record_batch(
            &batch.queue_key.to_string(),
            !result.dead_lettered,
            batch.len(),
            elapsed.as_secs_f64(),
        );
        self.metrics
            .record_task_outcomes(result.succeeded(), result.failed());

        for (task, (_, outcome)) in batch.tasks.iter().zip(result.outcomes.iter()) {
            let callbacks = Arc::clone(&self.callbacks);
            let task = task.clone();
            let outcome = outcome.clone();
            tokio::spawn(async move {
                callbacks.deliver(&task, &outcome).await;
            });
        }
    }

    /// Whether the compute backend reports itself healthy.
    pub async fn health(&self) -> bool {
        self.backend.health().await
    }
}

/// Pairs each task with the backend result at the same position.
fn align_results(batch: &Batch, response: &BatchResponse) -> Vec<(Uuid, TaskOutcome)> {
    if response.task_results.len() != batch.len() {
        warn!(
            batch_id = %batch.batch_id,
            expected = batch.len(),
            received = response.task_results.len(),
            "Backend result count does not match batch size"
        );
    }

    batch
        .tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            let outcome = match response.task_results.get(index) {
                Some(value) => classify_result(value),
                None => TaskOutcome::Failed(MISSING_RESULT.to_string()),
            };
            (task.task_id, outcome)
        })
        .collect()
}

/// A result object with `status: "failed"` or a non-null `error` is a task failure.
fn classify_result(value: &serde_json::Value) -> TaskOutcome {
    if let Some(obj) = value.as_object() {
        let failed_status = obj.get("status").and_then(|s| s.as_str()) == Some("failed");
        let error = obj.get("error").filter(|e| !e.is_null());
        if failed_status || error.is_some() {
            let reason = error
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .unwrap_or_else(|| "failed".to_string());
            return TaskOutcome::Failed(reason);
        }
    }
    TaskOutcome::Succeeded(value.clone())
}

/// Admission gate plus dispatcher, as seen by the assemblers.
pub struct GatedDispatcher {
    gate: Arc<AdmissionGate>,
    dispatcher: Arc<Dispatcher>,
    metrics: MetricsCollector,
}

impl GatedDispatcher {
    pub fn new(gate: Arc<AdmissionGate>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            gate,
            dispatcher,
            metrics: MetricsCollector::new(),
        }
    }
}

#[async_trait]
impl BatchHandler for GatedDispatcher {
    async fn handle(&self, batch: Batch) {
        let _permit = self.gate.acquire(batch.queue_key.priority).await;
        self.metrics.inc_batches_in_flight();
        self.dispatcher.dispatch(&batch).await;
        self.metrics.dec_batches_in_flight();
    }
}
