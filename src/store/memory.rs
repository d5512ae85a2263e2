//! In-process queue store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::QueueStore;
use crate::error::QueueError;

/// Queue store that keeps every list in process memory.
///
/// Lists are `VecDeque`s with the newest record at the front, mirroring the
/// LPUSH/RPOP layout used by [`RedisStore`](super::RedisStore).
#[derive(Debug, Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of `queue`, oldest record first.
    pub fn snapshot(&self, queue: &str) -> Vec<String> {
        let lists = self.lists.lock().expect("memory store lock poisoned");
        lists
            .get(queue)
            .map(|list| list.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().expect("memory store lock poisoned");
        lists.entry(queue.to_string()).or_default().push_front(payload);
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let mut lists = self.lists.lock().expect("memory store lock poisoned");
        Ok(lists.get_mut(queue).and_then(|list| list.pop_back()))
    }

    async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        let lists = self.lists.lock().expect("memory store lock poisoned");
        Ok(lists.get(queue).map_or(0, VecDeque::len))
    }

    async fn remove(&self, queue: &str, payload: &str) -> Result<usize, QueueError> {
        let mut lists = self.lists.lock().expect("memory store lock poisoned");
        let Some(list) = lists.get_mut(queue) else {
            return Ok(0);
        };
        match list.iter().position(|item| item == payload) {
            Some(index) => {
                list.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn range(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError> {
        let lists = self.lists.lock().expect("memory store lock poisoned");
        Ok(lists
            .get(queue)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let store = MemoryStore::new();
        for item in ["a", "b", "c"] {
            store.push("q", item.to_string()).await.unwrap();
        }

        assert_eq!(store.len("q").await.unwrap(), 3);
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let store = MemoryStore::new();
        store.push("left", "1".to_string()).await.unwrap();

        assert_eq!(store.len("right").await.unwrap(), 0);
        assert_eq!(store.pop("right").await.unwrap(), None);
        assert_eq!(store.len("left").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_range() {
        let store = MemoryStore::new();
        for item in ["a", "b", "c"] {
            store.push("q", item.to_string()).await.unwrap();
        }

        assert_eq!(store.remove("q", "b").await.unwrap(), 1);
        assert_eq!(store.remove("q", "b").await.unwrap(), 0);
        assert_eq!(store.remove("missing", "b").await.unwrap(), 0);

        assert_eq!(store.range("q", 10).await.unwrap(), vec!["c", "a"]);
        assert_eq!(store.range("q", 1).await.unwrap(), vec!["c"]);
        assert_eq!(store.snapshot("q"), vec!["a", "c"]);
    }
}
