//! The three queue pipelines: usage records, session lifecycle events,
//! and quota refresh requests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use uplink_core::{decode_quota_request, decode_session_event, decode_usage_record};

use crate::delivery::{ControlPlaneClient, DeliveryOutcome};
use crate::metrics::HealthRegistry;
use crate::queue::QueueClient;

use super::enrich::Enricher;
use super::{PipelineError, QueuePipeline};

fn delivery_result(outcome: DeliveryOutcome) -> Result<u32, PipelineError> {
    match outcome {
        DeliveryOutcome::Accepted { attempts } => Ok(attempts),
        DeliveryOutcome::Rejected { reason, attempts } => {
            Err(PipelineError::Delivery { attempts, reason })
        }
        DeliveryOutcome::Unreachable {
            attempts,
            last_error,
        } => Err(PipelineError::Delivery {
            attempts,
            reason: last_error,
        }),
    }
}

/// Usage records: decode, enrich with server identity, deliver.
pub struct UsagePipeline {
    broker_queue: String,
    enricher: Enricher,
    client: Arc<ControlPlaneClient>,
    registry: Arc<HealthRegistry>,
}

impl UsagePipeline {
    #[must_use]
    pub fn new(
        broker_queue: String,
        enricher: Enricher,
        client: Arc<ControlPlaneClient>,
        registry: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            broker_queue,
            enricher,
            client,
            registry,
        }
    }
}

#[async_trait]
impl QueuePipeline for UsagePipeline {
    fn queue(&self) -> &'static str {
        "usage"
    }

    fn broker_queue(&self) -> &str {
        &self.broker_queue
    }

    async fn process(&self, payload: &[u8], correlation_id: &str) -> Result<(), PipelineError> {
        let record = decode_usage_record(payload)?;
        let transaction_id = record.transaction_id.clone();
        let enriched = self.enricher.enrich(record);
        let outcome = self.client.submit_usage(&enriched, correlation_id).await;
        self.registry.record_delivery(&outcome);
        let attempts = delivery_result(outcome)?;
        info!(
            "usage record {} delivered after {} attempt(s)",
            transaction_id, attempts
        );
        Ok(())
    }
}

/// Session lifecycle events: decode and deliver as-is.
pub struct SessionPipeline {
    broker_queue: String,
    client: Arc<ControlPlaneClient>,
    registry: Arc<HealthRegistry>,
}

impl SessionPipeline {
    #[must_use]
    pub fn new(
        broker_queue: String,
        client: Arc<ControlPlaneClient>,
        registry: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            broker_queue,
            client,
            registry,
        }
    }
}

#[async_trait]
impl QueuePipeline for SessionPipeline {
    fn queue(&self) -> &'static str {
        "session_lifecycle"
    }

    fn broker_queue(&self) -> &str {
        &self.broker_queue
    }

    async fn process(&self, payload: &[u8], correlation_id: &str) -> Result<(), PipelineError> {
        let event = decode_session_event(payload)?;
        let outcome = self.client.send_session_event(&event, correlation_id).await;
        self.registry.record_delivery(&outcome);
        let attempts = delivery_result(outcome)?;
        info!(
            "session {} {} delivered after {} attempt(s)",
            event.session_id,
            event.event_type.as_str(),
            attempts
        );
        Ok(())
    }
}

/// Quota refresh requests: decode, deliver, and forward any grant back to
/// the upstream server through the response queue.
pub struct QuotaPipeline {
    broker_queue: String,
    response_queue: String,
    client: Arc<ControlPlaneClient>,
    queue_client: Arc<QueueClient>,
    registry: Arc<HealthRegistry>,
}

impl QuotaPipeline {
    #[must_use]
    pub fn new(
        broker_queue: String,
        response_queue: String,
        client: Arc<ControlPlaneClient>,
        queue_client: Arc<QueueClient>,
        registry: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            broker_queue,
            response_queue,
            client,
            queue_client,
            registry,
        }
    }
}

#[async_trait]
impl QueuePipeline for QuotaPipeline {
    fn queue(&self) -> &'static str {
        "quota_refresh"
    }

    fn broker_queue(&self) -> &str {
        &self.broker_queue
    }

    async fn process(&self, payload: &[u8], correlation_id: &str) -> Result<(), PipelineError> {
        let request = decode_quota_request(payload)?;
        let (outcome, grant) = self.client.refresh_quota(&request, correlation_id).await;
        self.registry.record_delivery(&outcome);
        let attempts = delivery_result(outcome)?;
        info!(
            "quota refresh {} delivered after {} attempt(s)",
            request.transaction_id, attempts
        );

        // The request itself is already delivered; forwarding the grant is
        // best-effort. A lost grant is recovered by the upstream server's
        // own refresh cycle.
        if let Some(grant) = grant {
            match serde_json::to_vec(&grant) {
                Ok(body) => {
                    if let Err(err) = self.queue_client.push(&self.response_queue, &body).await {
                        error!(
                            "failed to forward quota grant for {}: {}",
                            grant.transaction_id, err
                        );
                    } else {
                        info!(
                            "quota grant for {} forwarded ({} units, final: {})",
                            grant.transaction_id, grant.granted_amount, grant.final_grant
                        );
                    }
                }
                Err(err) => error!(
                    "unserializable quota grant for {}: {}",
                    request.transaction_id, err
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_maps_to_attempt_count() {
        assert_eq!(
            delivery_result(DeliveryOutcome::Accepted { attempts: 3 }).expect("accepted"),
            3
        );
    }

    #[test]
    fn rejection_and_exhaustion_map_to_delivery_errors() {
        let rejected = delivery_result(DeliveryOutcome::Rejected {
            reason: "status 422".to_string(),
            attempts: 1,
        })
        .expect_err("rejected");
        assert!(matches!(
            rejected,
            PipelineError::Delivery { attempts: 1, .. }
        ));

        let unreachable = delivery_result(DeliveryOutcome::Unreachable {
            attempts: 5,
            last_error: "status 503".to_string(),
        })
        .expect_err("unreachable");
        match unreachable {
            PipelineError::Delivery { attempts, reason } => {
                assert_eq!(attempts, 5);
                assert_eq!(reason, "status 503");
            }
            err => panic!("expected delivery error, got {err:?}"),
        }
    }
}
