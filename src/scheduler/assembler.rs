//! Batch assembly, one assembler per queue key.
//!
//! An assembler drains its queue into batches bounded by size and time. A
//! collection window opens when the previous batch is handed off; it closes
//! as soon as `max_batch_size` tasks are in hand or `max_batch_wait` has
//! elapsed. While the queue is empty the assembler sleeps in steps of at most
//! `idle_backoff`, never past the end of the window, so a deadline is missed
//! by at most one backoff step.
//!
//! ```text
//!   Collecting ──(full or window over, non-empty)──▶ Dispatching
//!       ▲                                                │
//!       └────────────────(handler returned)──────────────┘
//!   Collecting ──(shutdown, partial batch dispatched)──▶ Stopped
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::PriorityTaskQueue;
use super::task::{Batch, QueueKey, TaskRecord};

/// Receiver of closed batches.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Takes ownership of a batch. The assembler starts its next window only
    /// after this returns.
    async fn handle(&self, batch: Batch);
}

/// Observable assembler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Collecting,
    Dispatching,
    Stopped,
}

/// Batching bounds.
#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    pub max_batch_size: usize,
    pub max_batch_wait: Duration,
    pub idle_backoff: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_wait: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(100),
        }
    }
}

/// Drains one queue key into batches.
pub struct BatchAssembler {
    key: QueueKey,
    queue: PriorityTaskQueue,
    handler: Arc<dyn BatchHandler>,
    config: AssemblerConfig,
    state_tx: watch::Sender<AssemblerState>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl BatchAssembler {
    pub fn new(
        key: QueueKey,
        queue: PriorityTaskQueue,
        handler: Arc<dyn BatchHandler>,
        config: AssemblerConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (state_tx, _) = watch::channel(AssemblerState::Collecting);
        Self {
            key,
            queue,
            handler,
            config: AssemblerConfig {
                max_batch_size: config.max_batch_size.max(1),
                ..config
            },
            state_tx,
            shutdown_rx,
        }
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    /// Receiver that follows the assembler's state.
    pub fn state(&self) -> watch::Receiver<AssemblerState> {
        self.state_tx.subscribe()
    }

    /// Runs the assembler on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Main loop. Returns once shutdown was requested and any partial batch
    /// has been handed off.
    pub async fn run(mut self) {
        info!(queue = %self.key, "Batch assembler started");

        loop {
            let (tasks, stopping) = self.collect().await;

            if !tasks.is_empty() {
                match Batch::new(self.key, tasks, self.config.max_batch_size) {
                    Ok(batch) => {
                        self.state_tx.send_replace(AssemblerState::Dispatching);
                        debug!(
                            queue = %self.key,
                            batch_id = %batch.batch_id,
                            tasks = batch.len(),
                            "Batch closed"
                        );
                        self.handler.handle(batch).await;
                    }
                    Err(e) => {
                        error!(queue = %self.key, error = %e, "Rejected assembled batch");
                    }
                }
            }

            if stopping {
                break;
            }
        }

        self.state_tx.send_replace(AssemblerState::Stopped);
        info!(queue = %self.key, "Batch assembler stopped");
    }

    /// Collects one window of tasks. The flag is true when shutdown was seen.
    async fn collect(&mut self) -> (Vec<TaskRecord>, bool) {
        self.state_tx.send_replace(AssemblerState::Collecting);
        let window_start = Instant::now();
        let mut tasks = Vec::with_capacity(self.config.max_batch_size);

        loop {
            if self.shutdown_requested() {
                return (tasks, true);
            }
            if tasks.len() >= self.config.max_batch_size
                || window_start.elapsed() >= self.config.max_batch_wait
            {
                return (tasks, false);
            }

            match self.queue.dequeue_one(self.key).await {
                Ok(Some(task)) => {
                    tasks.push(task);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(queue = %self.key, error = %e, "Failed to dequeue task");
                }
            }

            let remaining = self
                .config
                .max_batch_wait
                .saturating_sub(window_start.elapsed());
            let pause = self.config.idle_backoff.min(remaining);

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.shutdown_rx.recv() => {
                    return (tasks, true);
                }
            }
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        match self.shutdown_rx.try_recv() {
            Ok(()) => true,
            Err(broadcast::error::TryRecvError::Closed) => true,
            Err(broadcast::error::TryRecvError::Lagged(_)) => true,
            Err(broadcast::error::TryRecvError::Empty) => false,
        }
    }
}
