//! Broker backend trait: the minimal list-queue surface the agent needs.
//!
//! Two implementations: [`RedisBackend`](super::RedisBackend) for
//! production and [`MemoryBackend`](super::MemoryBackend) for development
//! and tests. Both honor the same reliable-queue contract: pop moves the
//! message into a processing list, acknowledge removes it there, so a
//! crash between the two leaves the message recoverable.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::QueueError;

/// List-queue operations against named queues.
///
/// Wrapped in `Arc<dyn QueueBackend>` and shared by every worker; all
/// operations are safe for concurrent use.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Blocks up to `timeout` for a message on `source`, atomically moving
    /// it to `processing`. Returns `None` on timeout.
    async fn pop_to_processing(
        &self,
        source: &str,
        processing: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, QueueError>;

    /// Removes one occurrence of `payload` from `processing`. Returns
    /// `false` if it was not there (already acknowledged or recovered).
    async fn acknowledge(&self, processing: &str, payload: &[u8]) -> Result<bool, QueueError>;

    /// Appends a payload to `queue`.
    async fn push(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Number of pending entries in `queue`.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    /// Moves every entry of `processing` back onto `source`, oldest first.
    /// Returns how many were moved. Used at startup to recover messages a
    /// previous run popped but never acknowledged.
    async fn requeue_processing(&self, processing: &str, source: &str) -> Result<u64, QueueError>;

    /// Drops every pending entry of `queue`, returning how many were
    /// dropped. Does not touch the processing list.
    async fn purge(&self, queue: &str) -> Result<u64, QueueError>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<(), QueueError>;
}
