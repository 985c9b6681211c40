//! Queue transport: backend trait, Redis and in-memory backends, and the
//! [`QueueClient`] handle the rest of the agent talks to.

mod backend;
mod memory;
mod redis;

pub use backend::QueueBackend;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Errors surfaced by the queue transport.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker refused a command or the connection failed.
    #[error("broker error: {0}")]
    Broker(#[from] ::redis::RedisError),
    /// The configured broker URL names a scheme no backend handles.
    #[error("unsupported broker url: {0}")]
    UnsupportedUrl(String),
}

/// Shared handle to the configured broker.
///
/// Owns the processing-list naming convention so callers deal in logical
/// queue names only. Cheap to clone; all clones share one backend.
#[derive(Clone)]
pub struct QueueClient {
    backend: Arc<dyn QueueBackend>,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient").finish_non_exhaustive()
    }
}

impl QueueClient {
    #[must_use]
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Connects to the broker named by `url`.
    ///
    /// `redis://` and `rediss://` select the Redis backend; `memory://`
    /// selects the in-process backend used by tests and local development.
    ///
    /// # Errors
    /// [`QueueError::UnsupportedUrl`] for any other scheme, or the broker
    /// error if the Redis connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            let backend = RedisBackend::connect(url).await?;
            Ok(Self::new(Arc::new(backend)))
        } else if url.starts_with("memory://") {
            Ok(Self::new(Arc::new(MemoryBackend::new())))
        } else {
            Err(QueueError::UnsupportedUrl(url.to_string()))
        }
    }

    /// Broker-side name of the processing list paired with `queue`.
    #[must_use]
    pub fn processing_name(queue: &str) -> String {
        format!("{queue}:processing")
    }

    /// Blocks up to `timeout` for the oldest message on `queue`, moving it
    /// into the paired processing list. `None` on timeout.
    ///
    /// # Errors
    /// Broker failure. Timing out is not an error.
    pub async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Bytes>, QueueError> {
        self.backend
            .pop_to_processing(queue, &Self::processing_name(queue), timeout)
            .await
    }

    /// Removes a fully handled message from the processing list. Returns
    /// `false` if it was no longer there.
    ///
    /// # Errors
    /// Broker failure.
    pub async fn ack(&self, queue: &str, payload: &[u8]) -> Result<bool, QueueError> {
        self.backend
            .acknowledge(&Self::processing_name(queue), payload)
            .await
    }

    /// Appends a payload to `queue`.
    ///
    /// # Errors
    /// Broker failure.
    pub async fn push(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.backend.push(queue, payload).await
    }

    /// Number of pending messages on `queue`.
    ///
    /// # Errors
    /// Broker failure.
    pub async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        self.backend.depth(queue).await
    }

    /// Moves messages a previous run left in the processing list back onto
    /// `queue`. Returns how many were moved. Called once at startup before
    /// consumers begin popping.
    ///
    /// # Errors
    /// Broker failure.
    pub async fn recover_processing(&self, queue: &str) -> Result<u64, QueueError> {
        self.backend
            .requeue_processing(&Self::processing_name(queue), queue)
            .await
    }

    /// Drops every pending message on `queue`, returning the count.
    ///
    /// # Errors
    /// Broker failure.
    pub async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        self.backend.purge(queue).await
    }

    /// Round-trips a liveness probe to the broker.
    ///
    /// # Errors
    /// Broker failure.
    pub async fn ping(&self) -> Result<(), QueueError> {
        self.backend.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn memory_client() -> QueueClient {
        QueueClient::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn processing_name_follows_convention() {
        assert_eq!(
            QueueClient::processing_name("queue:usage_records"),
            "queue:usage_records:processing"
        );
    }

    #[tokio::test]
    async fn connect_rejects_unknown_scheme() {
        let err = QueueClient::connect("amqp://localhost").await.unwrap_err();
        assert!(matches!(err, QueueError::UnsupportedUrl(url) if url.starts_with("amqp")));
    }

    #[tokio::test]
    async fn connect_memory_scheme() {
        let client = QueueClient::connect("memory://").await.expect("connect");
        client.push("q", b"m").await.expect("push");
        assert_eq!(client.depth("q").await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn pop_ack_cycle_clears_both_lists() {
        let client = memory_client();
        client.push("q", b"m").await.unwrap();

        let popped = client.pop("q", TIMEOUT).await.unwrap().expect("message");
        assert_eq!(popped.as_ref(), b"m");
        assert_eq!(client.depth("q").await.unwrap(), 0);

        assert!(client.ack("q", &popped).await.unwrap());
        assert_eq!(
            client.depth(&QueueClient::processing_name("q")).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn unacknowledged_message_survives_via_recovery() {
        let client = memory_client();
        client.push("q", b"m").await.unwrap();
        client.pop("q", TIMEOUT).await.unwrap();

        // Simulates a restart: the message sits in processing, recovery
        // puts it back where a consumer will see it.
        assert_eq!(client.recover_processing("q").await.unwrap(), 1);
        let recovered = client.pop("q", TIMEOUT).await.unwrap().expect("message");
        assert_eq!(recovered.as_ref(), b"m");
    }
}
