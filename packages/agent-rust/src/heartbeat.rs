//! Registration and periodic heartbeats, with a failure-counting circuit
//! that stops beating into a dead control plane.

use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use uplink_core::{Heartbeat, ServerRegistration};

use crate::config::{HeartbeatConfig, ServerIdentity};
use crate::delivery::ControlPlaneClient;
use crate::metrics::{HealthRegistry, RegistrySnapshot};
use crate::shutdown::ShutdownController;

/// Pause between registration attempts. Registration uses the client's
/// normal retry budget per attempt; this delay sits between budgets.
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct TrackerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Counts consecutive heartbeat failures and opens after a threshold.
///
/// While open, `should_attempt` stays false until the backoff elapses;
/// the next beat is then a probe. A successful probe resets everything, a
/// failed one re-opens with a doubled delay.
#[derive(Debug)]
pub struct ConnectionTracker {
    threshold: u32,
    base_delay: Duration,
    max_delay: Duration,
    inner: Mutex<TrackerState>,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            base_delay: config.backoff_base_delay,
            max_delay: config.backoff_max_delay,
            inner: Mutex::new(TrackerState::default()),
        }
    }

    pub fn mark_success(&self) {
        let mut state = self.inner.lock();
        if state.consecutive_failures > 0 {
            debug!(
                "connection recovered after {} failure(s)",
                state.consecutive_failures
            );
        }
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Records one failure; returns the new consecutive count.
    pub fn mark_failure(&self) -> u32 {
        let mut state = self.inner.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
        }
        state.consecutive_failures
    }

    /// Whether the next beat should be sent now.
    #[must_use]
    pub fn should_attempt(&self) -> bool {
        let state = self.inner.lock();
        match state.opened_at {
            None => true,
            Some(opened) => opened.elapsed() >= self.backoff_delay(state.consecutive_failures),
        }
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.threshold).min(31);
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

fn heartbeat_metrics(snapshot: &RegistrySnapshot) -> serde_json::Map<String, serde_json::Value> {
    let processed: u64 = snapshot.queues.values().map(|queue| queue.processed).sum();
    let failed: u64 = snapshot.queues.values().map(|queue| queue.failed).sum();
    let backlog: u64 = snapshot.queues.values().map(|queue| queue.depth).sum();
    let mut metrics = serde_json::Map::new();
    metrics.insert("records_processed".to_string(), json!(processed));
    metrics.insert("records_failed".to_string(), json!(failed));
    metrics.insert("queue_backlog".to_string(), json!(backlog));
    metrics.insert(
        "deliveries_accepted".to_string(),
        json!(snapshot.deliveries.accepted),
    );
    metrics
}

/// Registers the server once, then beats on an interval until shutdown.
pub struct HeartbeatWorker {
    client: Arc<ControlPlaneClient>,
    registry: Arc<HealthRegistry>,
    shutdown: Arc<ShutdownController>,
    identity: ServerIdentity,
    interval: Duration,
    tracker: ConnectionTracker,
}

impl HeartbeatWorker {
    #[must_use]
    pub fn new(
        client: Arc<ControlPlaneClient>,
        registry: Arc<HealthRegistry>,
        shutdown: Arc<ShutdownController>,
        identity: ServerIdentity,
        config: &HeartbeatConfig,
    ) -> Self {
        Self {
            client,
            registry,
            shutdown,
            identity,
            interval: config.interval,
            tracker: ConnectionTracker::new(config),
        }
    }

    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown.shutdown_receiver();
        if !self.register(&mut shutdown_rx).await {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.beat().await,
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("heartbeat worker stopped");
    }

    /// Retries registration until accepted. Returns false when shutdown
    /// arrives first.
    async fn register(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let registration = ServerRegistration {
            server_id: self.identity.server_id.clone(),
            region: self.identity.region.clone(),
            version: self.identity.version.clone(),
            capabilities: self.identity.capabilities.clone(),
        };
        loop {
            let correlation_id = Uuid::new_v4().to_string();
            let outcome = self
                .client
                .register_server(&registration, &correlation_id)
                .await;
            if outcome.is_accepted() {
                info!(
                    "server {} registered with control plane",
                    registration.server_id
                );
                self.registry.set_control_plane_up(true);
                return true;
            }
            self.registry.set_control_plane_up(false);
            warn!(
                "registration {}; retrying in {:?}",
                outcome.label(),
                REGISTER_RETRY_DELAY
            );
            tokio::select! {
                () = tokio::time::sleep(REGISTER_RETRY_DELAY) => {}
                _ = shutdown_rx.changed() => return false,
            }
        }
    }

    async fn beat(&self) {
        if !self.tracker.should_attempt() {
            debug!("heartbeat skipped; circuit open");
            return;
        }
        let snapshot = self.registry.snapshot();
        let heartbeat = Heartbeat {
            status: self.registry.server_status(),
            metrics: heartbeat_metrics(&snapshot),
            sent_at: Utc::now(),
        };
        let correlation_id = Uuid::new_v4().to_string();
        let outcome = self.client.send_heartbeat(&heartbeat, &correlation_id).await;
        if outcome.is_accepted() {
            self.registry.mark_heartbeat(Utc::now());
            self.registry.set_control_plane_up(true);
            self.tracker.mark_success();
        } else {
            self.registry.set_control_plane_up(false);
            let failures = self.tracker.mark_failure();
            warn!(
                "heartbeat {}; {} consecutive failure(s)",
                outcome.label(),
                failures
            );
        }
    }
}
