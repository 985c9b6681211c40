//! Redis implementation of [`QueueBackend`] on list commands.
//!
//! Pop is `BLMOVE` right-to-left into the processing list (the reliable
//! queue pattern: producers `LPUSH`, consumers take from the right);
//! acknowledge is `LREM` on the processing list. The
//! [`ConnectionManager`] reconnects on its own, so a broker blip surfaces
//! as one failed call, not a dead client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Direction};
use tracing::{debug, info};

use super::{QueueBackend, QueueError};

/// Redis-backed queue client sharing one multiplexed connection.
pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connects to the broker at `url` (`redis://` or `rediss://`).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Broker`] if the URL does not parse or the
    /// initial connection fails.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        if url.starts_with("rediss://") {
            info!("broker TLS enabled (rediss://)");
        }
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        debug!("broker connection manager established");
        Ok(Self { manager })
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn pop_to_processing(
        &self,
        source: &str,
        processing: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, QueueError> {
        let mut conn = self.manager.clone();
        let popped: Option<Vec<u8>> = conn
            .blmove(
                source,
                processing,
                Direction::Right,
                Direction::Left,
                timeout.as_secs_f64(),
            )
            .await?;
        Ok(popped.map(Bytes::from))
    }

    async fn acknowledge(&self, processing: &str, payload: &[u8]) -> Result<bool, QueueError> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.lrem(processing, 1, payload).await?;
        Ok(removed > 0)
    }

    async fn push(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: () = conn.lpush(queue, payload).await?;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.manager.clone();
        let len: u64 = conn.llen(queue).await?;
        Ok(len)
    }

    async fn requeue_processing(&self, processing: &str, source: &str) -> Result<u64, QueueError> {
        let mut conn = self.manager.clone();
        let mut moved = 0u64;
        loop {
            let entry: Option<Vec<u8>> = conn
                .lmove(processing, source, Direction::Right, Direction::Left)
                .await?;
            if entry.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.manager.clone();
        // LLEN then DEL races a concurrent producer, which is fine: purge
        // is an operator command, not an invariant.
        let len: u64 = conn.llen(queue).await?;
        let _: () = conn.del(queue).await?;
        Ok(len)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: () = cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
