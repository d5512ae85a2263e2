//! Resizable pool of story workers.
//!
//! Each worker pulls stories from the admission queue (paid before free) and
//! hands them to the [`TaskSplitter`]. Workers run as independent async tasks
//! and own their state; the pool observes them through watch channels.
//!
//! # Worker lifecycle
//!
//! ```text
//!   Idle ──▶ Processing ──▶ Idle
//!   Idle | Processing ──(stop requested)──▶ Stopping ──▶ Stopped
//! ```
//!
//! A stop request is only honoured between stories, so an in-flight story
//! is always finished; a worker that is asked to stop mid-story reports
//! `Stopping` until it gets there. Resizes are serialized. Shrinking picks idle workers
//! first, then the newest ones, and waits up to the grace period for them to
//! stop. If the grace period runs out the stop requests are revoked and any
//! worker that did stop is replaced, leaving the pool at its previous size.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::backoff_delay;
use super::queue::StoryQueue;
use super::splitter::TaskSplitter;
use super::task::StoryRequest;
use crate::error::DecompositionError;
use crate::metrics::MetricsCollector;

/// Upper bound on the pause between decomposition attempts of one story.
const MAX_STORY_BACKOFF: Duration = Duration::from_secs(10);

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Requested size is outside the configured bounds.
    #[error("Worker count {requested} is outside the allowed range [{min}, {max}]")]
    OutOfBounds {
        requested: usize,
        min: usize,
        max: usize,
    },

    /// Workers selected for removal did not stop within the grace period.
    #[error("Resize to {target} workers timed out after {grace:?}; pool kept at {current} workers")]
    ResizeTimeout {
        target: usize,
        current: usize,
        grace: Duration,
    },
}

/// State of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Processing,
    Stopping,
    Stopped,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub status: WorkerStatus,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// How long an idle worker waits before polling the admission queue again.
    pub poll_interval: Duration,
    /// How long a shrink waits for selected workers to stop.
    pub grace_period: Duration,
    /// Decomposition attempts per story before it is dead-lettered.
    pub story_max_attempts: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            grace_period: Duration::from_secs(60),
            story_max_attempts: 3,
        }
    }
}

impl WorkerPoolConfig {
    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the grace period for shrinking.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Sets the per-story attempt limit.
    pub fn with_story_max_attempts(mut self, attempts: u32) -> Self {
        self.story_max_attempts = attempts.max(1);
        self
    }
}

/// Pool-side handle on a running worker.
struct WorkerEntry {
    id: String,
    seq: u64,
    stop_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<WorkerStatus>,
    handle: JoinHandle<()>,
}

impl WorkerEntry {
    fn status(&self) -> WorkerStatus {
        *self.status_rx.borrow()
    }
}

/// Pool of story workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    stories: StoryQueue,
    splitter: TaskSplitter,
    workers: Mutex<Vec<WorkerEntry>>,
    resize_lock: tokio::sync::Mutex<()>,
    next_seq: AtomicU64,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new(config: WorkerPoolConfig, stories: StoryQueue, splitter: TaskSplitter) -> Self {
        Self {
            config,
            stories,
            splitter,
            workers: Mutex::new(Vec::new()),
            resize_lock: tokio::sync::Mutex::new(()),
            next_seq: AtomicU64::new(1),
            metrics: MetricsCollector::new(),
        }
    }

    /// Starts `count` workers.
    pub async fn start(&self, count: usize) -> Result<(), PoolError> {
        self.resize(count).await
    }

    /// Changes the number of running workers to `target`.
    ///
    /// Calls are serialized; a repeated call with the current size is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ResizeTimeout` if the workers selected for removal
    /// did not stop within the grace period. The pool size is unchanged in
    /// that case.
    pub async fn resize(&self, target: usize) -> Result<(), PoolError> {
        let _guard = self.resize_lock.lock().await;

        self.reap_stopped().await;
        let current = self.active_count();

        if target == current {
            return Ok(());
        }

        info!(current, target, "Resizing worker pool");

        if target > current {
            for _ in current..target {
                self.spawn_worker();
            }
            self.publish_size();
            info!(workers = target, "Worker pool grown");
            return Ok(());
        }

        let mut selected = self.signal_stop(current - target);
        let wait_all = async {
            for (_, status_rx) in selected.iter_mut() {
                // A closed channel means the worker task is gone.
                let _ = status_rx.wait_for(|s| *s == WorkerStatus::Stopped).await;
            }
        };

        let outcome = tokio::time::timeout(self.config.grace_period, wait_all).await;
        match outcome {
            Ok(()) => {
                let ids: Vec<String> = selected.into_iter().map(|(id, _)| id).collect();
                self.remove_workers(&ids).await;
                self.publish_size();
                info!(workers = target, "Worker pool shrunk");
                Ok(())
            }
            Err(_) => {
                warn!(
                    target,
                    current,
                    grace_secs = self.config.grace_period.as_secs_f64(),
                    "Workers did not stop within grace period, reverting resize"
                );
                self.revert_stop(selected).await;
                self.publish_size();
                Err(PoolError::ResizeTimeout {
                    target,
                    current,
                    grace: self.config.grace_period,
                })
            }
        }
    }

    /// Stops every worker, letting in-flight stories finish.
    pub async fn stop(&self) -> Result<(), PoolError> {
        self.resize(0).await
    }

    /// Workers that have not stopped.
    pub fn active_count(&self) -> usize {
        let workers = self.workers.lock().expect("worker registry lock poisoned");
        workers
            .iter()
            .filter(|w| w.status() != WorkerStatus::Stopped)
            .count()
    }

    /// Current id and status of every registered worker, oldest first.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.lock().expect("worker registry lock poisoned");
        workers
            .iter()
            .map(|w| WorkerSnapshot {
                worker_id: w.id.clone(),
                status: w.status(),
            })
            .collect()
    }

    fn spawn_worker(&self) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("worker-{}", seq);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(WorkerStatus::Idle);

        let worker = Worker {
            id: id.clone(),
            stories: self.stories.clone(),
            splitter: self.splitter.clone(),
            poll_interval: self.config.poll_interval,
            story_max_attempts: self.config.story_max_attempts.max(1),
            status_tx,
            metrics: self.metrics.clone(),
        };
        let handle = tokio::spawn(worker.run(stop_rx));

        let mut workers = self.workers.lock().expect("worker registry lock poisoned");
        workers.push(WorkerEntry {
            id,
            seq,
            stop_tx,
            status_rx,
            handle,
        });
    }

    /// Requests `count` workers to stop, idle ones first, then the newest.
    fn signal_stop(&self, count: usize) -> Vec<(String, watch::Receiver<WorkerStatus>)> {
        let workers = self.workers.lock().expect("worker registry lock poisoned");
        let mut candidates: Vec<&WorkerEntry> = workers
            .iter()
            .filter(|w| w.status() != WorkerStatus::Stopped)
            .collect();
        candidates.sort_by_key(|w| (w.status() != WorkerStatus::Idle, std::cmp::Reverse(w.seq)));

        candidates
            .into_iter()
            .take(count)
            .map(|w| {
                debug!(worker_id = %w.id, status = ?w.status(), "Requesting worker stop");
                w.stop_tx.send_replace(true);
                (w.id.clone(), w.status_rx.clone())
            })
            .collect()
    }

    /// Withdraws stop requests after a timed-out shrink and replaces any
    /// worker that stopped anyway.
    async fn revert_stop(&self, selected: Vec<(String, watch::Receiver<WorkerStatus>)>) {
        {
            let workers = self.workers.lock().expect("worker registry lock poisoned");
            for w in workers.iter() {
                if selected.iter().any(|(id, _)| *id == w.id) {
                    w.stop_tx.send_replace(false);
                }
            }
        }

        let mut stopped = Vec::new();
        for (id, mut status_rx) in selected {
            let status = match status_rx.wait_for(|s| *s != WorkerStatus::Stopping).await {
                Ok(status) => *status,
                Err(_) => WorkerStatus::Stopped,
            };
            if status == WorkerStatus::Stopped {
                stopped.push(id);
            }
        }

        if !stopped.is_empty() {
            self.remove_workers(&stopped).await;
            for _ in 0..stopped.len() {
                self.spawn_worker();
            }
            info!(replaced = stopped.len(), "Replaced workers stopped during reverted resize");
        }
    }

    /// Drops registry entries for workers that exited on their own.
    async fn reap_stopped(&self) {
        let ids: Vec<String> = {
            let workers = self.workers.lock().expect("worker registry lock poisoned");
            workers
                .iter()
                .filter(|w| w.status() == WorkerStatus::Stopped)
                .map(|w| w.id.clone())
                .collect()
        };
        if !ids.is_empty() {
            warn!(workers = ?ids, "Removing workers that stopped unexpectedly");
            self.remove_workers(&ids).await;
        }
    }

    async fn remove_workers(&self, ids: &[String]) {
        let removed: Vec<WorkerEntry> = {
            let mut workers = self.workers.lock().expect("worker registry lock poisoned");
            let (removed, kept): (Vec<_>, Vec<_>) =
                workers.drain(..).partition(|w| ids.contains(&w.id));
            *workers = kept;
            removed
        };

        for entry in removed {
            if let Err(e) = entry.handle.await {
                error!(worker_id = %entry.id, error = %e, "Worker task panicked");
            }
        }
    }

    fn publish_size(&self) {
        self.metrics.update_workers(self.active_count());
    }
}

/// A single worker that decomposes stories from the admission queue.
struct Worker {
    id: String,
    stories: StoryQueue,
    splitter: TaskSplitter,
    poll_interval: Duration,
    story_max_attempts: u32,
    status_tx: watch::Sender<WorkerStatus>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop. Stop requests are honoured between stories only.
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            if *stop_rx.borrow_and_update() {
                self.status_tx.send_replace(WorkerStatus::Stopping);
                // The request may have been withdrawn meanwhile.
                if *stop_rx.borrow_and_update() {
                    info!(worker_id = %self.id, "Worker received stop signal");
                    break;
                }
                self.status_tx.send_replace(WorkerStatus::Idle);
            }

            match self.stories.next_story().await {
                Ok(Some(story)) => {
                    self.status_tx.send_replace(WorkerStatus::Processing);
                    self.process_watching_stop(story, &mut stop_rx).await;
                    self.status_tx.send_replace(WorkerStatus::Idle);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to fetch story");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        warn!(worker_id = %self.id, "Pool dropped, worker exiting");
                        break;
                    }
                }
            }
        }

        self.status_tx.send_replace(WorkerStatus::Stopped);
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs one story to completion while mirroring stop requests into the
    /// published status.
    async fn process_watching_stop(
        &self,
        story: StoryRequest,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        let work = self.process_story(story);
        tokio::pin!(work);
        let mut watching = true;

        loop {
            tokio::select! {
                _ = &mut work => return,
                changed = stop_rx.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let status = if *stop_rx.borrow_and_update() {
                        debug!(worker_id = %self.id, "Stop requested, finishing in-flight story");
                        WorkerStatus::Stopping
                    } else {
                        WorkerStatus::Processing
                    };
                    self.status_tx.send_replace(status);
                }
            }
        }
    }

    /// Decomposes one story, requeueing or dead-lettering it on failure.
    async fn process_story(&self, mut story: StoryRequest) {
        story.attempts += 1;
        debug!(
            worker_id = %self.id,
            request_id = %story.request_id,
            attempt = story.attempts,
            "Processing story"
        );

        let err = match self.splitter.decompose(&story).await {
            Ok(decomposition) => {
                self.metrics.record_story("decomposed");
                debug!(
                    worker_id = %self.id,
                    story_id = %decomposition.story_id,
                    subtasks = decomposition.task_ids.len(),
                    "Story processed"
                );
                return;
            }
            Err(e) => e,
        };

        let retry = err.is_retryable() && story.attempts < self.story_max_attempts;
        if retry {
            let delay = backoff_delay(self.poll_interval, story.attempts, MAX_STORY_BACKOFF);
            warn!(
                worker_id = %self.id,
                request_id = %story.request_id,
                error = %err,
                remaining_attempts = self.story_max_attempts - story.attempts,
                delay_ms = delay.as_millis() as u64,
                "Story decomposition failed, requeueing after backoff"
            );
            tokio::time::sleep(delay).await;
        } else {
            error!(
                worker_id = %self.id,
                request_id = %story.request_id,
                error = %err,
                "Story decomposition failed, moving to dead letter queue"
            );
        }

        self.settle_failed_story(&story, &err, retry).await;
    }

    /// Hands a failed story back to the store: requeued when `retry` is set,
    /// dead-lettered otherwise or when the requeue fails. The worker keeps
    /// the story until one of the writes succeeds.
    async fn settle_failed_story(
        &self,
        story: &StoryRequest,
        err: &DecompositionError,
        retry: bool,
    ) {
        let mut pause = self.poll_interval.max(Duration::from_millis(10));

        loop {
            if retry {
                match self.stories.requeue(story).await {
                    Ok(()) => {
                        self.metrics.record_story("requeued");
                        return;
                    }
                    Err(e) => error!(
                        worker_id = %self.id,
                        request_id = %story.request_id,
                        error = %e,
                        "Failed to requeue story, moving to dead letter queue"
                    ),
                }
            }

            match self.stories.dead_letter(story, &err.to_string()).await {
                Ok(()) => {
                    self.metrics.record_story("dead_lettered");
                    return;
                }
                Err(e) => error!(
                    worker_id = %self.id,
                    request_id = %story.request_id,
                    error = %e,
                    retry_in_ms = pause.as_millis() as u64,
                    "Failed to move story to dead letter queue, holding it"
                ),
            }

            tokio::time::sleep(pause).await;
            pause = (pause * 2).min(MAX_STORY_BACKOFF);
        }
    }
}
