//! Terminal failure path: wraps doomed payloads and pushes them onto the
//! dead-letter queue for manual replay.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use uplink_core::{DeadLetterEntry, DeadLetterReason};

use crate::metrics::HealthRegistry;
use crate::queue::{QueueClient, QueueError};

/// A dead-letter entry could not be persisted. The caller must leave the
/// original message unacknowledged so startup recovery can retry it.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter entry failed to encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Sink for messages that exhausted their delivery budget or failed
/// validation. Entries keep the raw payload (lossy UTF-8) plus a SHA-256
/// digest of the original bytes, enough to replay manually and to spot
/// payloads mangled in transit.
pub struct DeadLetterSink {
    client: Arc<QueueClient>,
    queue: String,
    registry: Arc<HealthRegistry>,
}

impl DeadLetterSink {
    #[must_use]
    pub fn new(client: Arc<QueueClient>, queue: String, registry: Arc<HealthRegistry>) -> Self {
        Self {
            client,
            queue,
            registry,
        }
    }

    /// Persists one terminal failure, returning the generated entry id.
    ///
    /// # Errors
    /// Encoding or broker failure; the sink counts it and the caller must
    /// not acknowledge the source message.
    pub async fn submit(
        &self,
        source_queue: &str,
        reason: DeadLetterReason,
        detail: &str,
        attempts: u32,
        payload: &[u8],
    ) -> Result<String, DeadLetterError> {
        let entry = DeadLetterEntry {
            entry_id: Uuid::new_v4().to_string(),
            source_queue: source_queue.to_string(),
            reason,
            detail: detail.to_string(),
            attempts,
            payload: String::from_utf8_lossy(payload).into_owned(),
            payload_sha256: hex::encode(Sha256::digest(payload)),
            failed_at: Utc::now(),
        };
        let result = self.push_entry(&entry).await;
        match result {
            Ok(()) => {
                self.registry.record_dead_lettered(source_queue);
                Ok(entry.entry_id)
            }
            Err(err) => {
                self.registry.record_dead_letter_failure();
                Err(err)
            }
        }
    }

    async fn push_entry(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let body = serde_json::to_vec(entry)?;
        self.client.push(&self.queue, &body).await?;
        Ok(())
    }
}
