//! In-memory [`QueueBackend`] for development and tests (`memory://`).
//!
//! Same observable semantics as the Redis backend: FIFO lists, pop moves
//! the message into the processing list, acknowledge removes it there.
//! Blocking pop is emulated by polling, which keeps the implementation
//! lock-simple at the cost of a few milliseconds of latency nobody
//! measures in tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{QueueBackend, QueueError};

const POP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Process-local queue store backed by named FIFO lists.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    lists: Mutex<HashMap<String, VecDeque<Bytes>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop(&self, source: &str, processing: &str) -> Option<Bytes> {
        let mut lists = self.lists.lock();
        let message = lists.get_mut(source)?.pop_back()?;
        lists
            .entry(processing.to_string())
            .or_default()
            .push_front(message.clone());
        Some(message)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn pop_to_processing(
        &self,
        source: &str,
        processing: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_pop(source, processing) {
                return Ok(Some(message));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL).await;
        }
    }

    async fn acknowledge(&self, processing: &str, payload: &[u8]) -> Result<bool, QueueError> {
        let mut lists = self.lists.lock();
        let Some(list) = lists.get_mut(processing) else {
            return Ok(false);
        };
        match list.iter().position(|entry| entry.as_ref() == payload) {
            Some(index) => {
                list.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn push(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.lists
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_front(Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let lists = self.lists.lock();
        Ok(lists.get(queue).map_or(0, |list| list.len() as u64))
    }

    async fn requeue_processing(&self, processing: &str, source: &str) -> Result<u64, QueueError> {
        let mut lists = self.lists.lock();
        let mut moved = 0;
        // Tail of processing is the oldest in-flight message; moving it to
        // the head of source keeps recovered messages behind the backlog in
        // original order, same as the Redis LMOVE loop.
        while let Some(message) = lists.get_mut(processing).and_then(VecDeque::pop_back) {
            lists
                .entry(source.to_string())
                .or_default()
                .push_front(message);
            moved += 1;
        }
        Ok(moved)
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        let mut lists = self.lists.lock();
        Ok(lists
            .remove(queue)
            .map_or(0, |list| list.len() as u64))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn pop_is_fifo_and_moves_to_processing() {
        let backend = MemoryBackend::new();
        backend.push("q", b"first").await.unwrap();
        backend.push("q", b"second").await.unwrap();

        let popped = backend
            .pop_to_processing("q", "q:processing", TIMEOUT)
            .await
            .unwrap()
            .expect("message");
        assert_eq!(popped.as_ref(), b"first");
        assert_eq!(backend.depth("q").await.unwrap(), 1);
        assert_eq!(backend.depth("q:processing").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pop_times_out_empty() {
        let backend = MemoryBackend::new();
        let popped = backend
            .pop_to_processing("q", "q:processing", TIMEOUT)
            .await
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn acknowledge_removes_exactly_one() {
        let backend = MemoryBackend::new();
        backend.push("q", b"m").await.unwrap();
        backend
            .pop_to_processing("q", "q:processing", TIMEOUT)
            .await
            .unwrap();

        assert!(backend.acknowledge("q:processing", b"m").await.unwrap());
        assert_eq!(backend.depth("q:processing").await.unwrap(), 0);
        // Second acknowledge finds nothing.
        assert!(!backend.acknowledge("q:processing", b"m").await.unwrap());
    }

    #[tokio::test]
    async fn requeue_restores_pop_order() {
        let backend = MemoryBackend::new();
        backend.push("q", b"a").await.unwrap();
        backend.push("q", b"b").await.unwrap();
        backend
            .pop_to_processing("q", "q:processing", TIMEOUT)
            .await
            .unwrap();
        backend
            .pop_to_processing("q", "q:processing", TIMEOUT)
            .await
            .unwrap();

        let moved = backend.requeue_processing("q:processing", "q").await.unwrap();
        assert_eq!(moved, 2);

        // Recovered messages pop in original order.
        let first = backend
            .pop_to_processing("q", "q:processing", TIMEOUT)
            .await
            .unwrap()
            .expect("message");
        assert_eq!(first.as_ref(), b"a");
    }

    #[tokio::test]
    async fn purge_reports_dropped_count() {
        let backend = MemoryBackend::new();
        backend.push("q", b"1").await.unwrap();
        backend.push("q", b"2").await.unwrap();
        backend.push("q", b"3").await.unwrap();

        assert_eq!(backend.purge("q").await.unwrap(), 3);
        assert_eq!(backend.depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blocking_pop_sees_late_push() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        let popper = {
            let backend = std::sync::Arc::clone(&backend);
            tokio::spawn(async move {
                backend
                    .pop_to_processing("q", "q:processing", Duration::from_secs(1))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.push("q", b"late").await.unwrap();

        let popped = popper.await.unwrap().expect("message");
        assert_eq!(popped.as_ref(), b"late");
    }
}
