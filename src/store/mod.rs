//! Queue store adapters.
//!
//! Every queue in the scheduler (per-key task queues, the story admission
//! queue, dead-letter lists) is a named ordered list in a shared store. This
//! module defines the [`QueueStore`] contract and its two implementations:
//!
//! - [`RedisStore`]: production adapter backed by a Redis `ConnectionManager`
//! - [`MemoryStore`]: in-process adapter for tests and single-process runs
//!
//! # List semantics
//!
//! `push` inserts at the head (LPUSH) and `pop` removes from the tail (RPOP),
//! so every list is FIFO. Pop atomicity under concurrent consumers is the
//! store's responsibility: a record returned by one `pop` is never returned
//! to another caller.

mod memory;
mod redis_store;

use async_trait::async_trait;

use crate::error::QueueError;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Contract of a networked ordered-list store.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends `payload` to the back of `queue`.
    async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError>;

    /// Removes and returns the oldest record of `queue`, if any. Never blocks.
    async fn pop(&self, queue: &str) -> Result<Option<String>, QueueError>;

    /// Number of records currently in `queue`.
    async fn len(&self, queue: &str) -> Result<usize, QueueError>;

    /// Removes one occurrence of `payload` from `queue`.
    ///
    /// Returns the number of removed records (0 or 1).
    async fn remove(&self, queue: &str, payload: &str) -> Result<usize, QueueError>;

    /// Returns up to `limit` records without removing them, newest first.
    async fn range(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), QueueError>;
}
