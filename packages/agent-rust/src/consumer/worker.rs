//! The per-queue worker loop: pop, process, acknowledge or dead-letter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use uplink_core::DeadLetterReason;

use crate::config::BrokerConfig;
use crate::metrics::HealthRegistry;
use crate::queue::QueueClient;
use crate::shutdown::ShutdownController;

use super::dead_letter::DeadLetterSink;
use super::{PipelineError, QueuePipeline};

fn reconnect_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.saturating_mul(2_u32.saturating_pow(exponent)).min(max)
}

/// Drains one queue through its pipeline until shutdown.
///
/// A message is acknowledged only after a terminal outcome: delivered, or
/// persisted to the dead-letter queue. The queue itself is never the
/// retry mechanism; all retries happen inside the delivery client before
/// acknowledgment. Broker failures back off and reconnect; they never end
/// the loop.
pub struct ConsumerWorker {
    pipeline: Arc<dyn QueuePipeline>,
    queue_client: Arc<QueueClient>,
    dead_letter: Arc<DeadLetterSink>,
    registry: Arc<HealthRegistry>,
    shutdown: Arc<ShutdownController>,
    pop_timeout: Duration,
    reconnect_base: Duration,
    reconnect_max: Duration,
}

impl ConsumerWorker {
    #[must_use]
    pub fn new(
        pipeline: Arc<dyn QueuePipeline>,
        queue_client: Arc<QueueClient>,
        dead_letter: Arc<DeadLetterSink>,
        registry: Arc<HealthRegistry>,
        shutdown: Arc<ShutdownController>,
        broker: &BrokerConfig,
    ) -> Self {
        Self {
            pipeline,
            queue_client,
            dead_letter,
            registry,
            shutdown,
            pop_timeout: broker.pop_timeout,
            reconnect_base: broker.reconnect_base_delay,
            reconnect_max: broker.reconnect_max_delay,
        }
    }

    /// Runs until the shutdown signal fires. Messages are processed in
    /// pop order, one at a time; a message picked up before the signal is
    /// finished before the loop exits.
    pub async fn run(self) {
        let queue = self.pipeline.queue();
        let broker_queue = self.pipeline.broker_queue().to_string();
        let mut shutdown_rx = self.shutdown.shutdown_receiver();
        let mut broker_failures: u32 = 0;
        info!("consumer for {} started on {}", queue, broker_queue);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                result = self.queue_client.pop(&broker_queue, self.pop_timeout) => match result {
                    Ok(Some(payload)) => {
                        broker_failures = 0;
                        let _guard = self.shutdown.in_flight_guard();
                        self.handle_message(&broker_queue, &payload).await;
                    }
                    Ok(None) => {
                        broker_failures = 0;
                    }
                    Err(err) => {
                        broker_failures += 1;
                        let delay = reconnect_delay(
                            self.reconnect_base,
                            self.reconnect_max,
                            broker_failures,
                        );
                        error!(
                            "pop from {} failed: {}; retrying in {:?}",
                            broker_queue, err, delay
                        );
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("consumer for {} stopped", queue);
    }

    /// Takes one popped message to a terminal outcome. Runs to completion
    /// even while a shutdown is pending; the runtime's drain deadline
    /// bounds how long that may take.
    async fn handle_message(&self, broker_queue: &str, payload: &[u8]) {
        let queue = self.pipeline.queue();
        let correlation_id = Uuid::new_v4().to_string();
        match self.pipeline.process(payload, &correlation_id).await {
            Ok(()) => {
                self.registry.record_processed(queue);
                self.acknowledge(broker_queue, payload).await;
            }
            Err(err) => {
                self.registry.record_failed(queue);
                let (reason, detail, attempts) = match &err {
                    PipelineError::Validation(cause) => {
                        (DeadLetterReason::ValidationError, cause.to_string(), 0)
                    }
                    PipelineError::Delivery { attempts, reason } => {
                        (DeadLetterReason::DeliveryFailed, reason.clone(), *attempts)
                    }
                };
                warn!("message on {} failed ({}): {}", queue, correlation_id, err);
                match self
                    .dead_letter
                    .submit(queue, reason, &detail, attempts, payload)
                    .await
                {
                    Ok(entry_id) => {
                        info!("message from {} dead-lettered as {}", queue, entry_id);
                        self.acknowledge(broker_queue, payload).await;
                    }
                    Err(sink_err) => {
                        // Not acknowledged: the message stays in the
                        // processing list and startup recovery will
                        // surface it again.
                        error!("dead-letter push for {} failed: {}", queue, sink_err);
                    }
                }
            }
        }
    }

    async fn acknowledge(&self, broker_queue: &str, payload: &[u8]) {
        match self.queue_client.ack(broker_queue, payload).await {
            Ok(true) => {}
            Ok(false) => warn!("message already gone from {} processing list", broker_queue),
            Err(err) => error!("acknowledge on {} failed: {}", broker_queue, err),
        }
    }
}
