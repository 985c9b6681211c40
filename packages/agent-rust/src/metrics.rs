//! Health/metrics registry: the single owned home for the agent's
//! counters and gauges.
//!
//! Producers hold the registry by `Arc` and mutate it through atomic
//! increment/set methods only; the HTTP layer reads point-in-time
//! [`RegistrySnapshot`]s. Every mutation is mirrored to the `metrics`
//! facade so the Prometheus exporter sees the same numbers -- no other
//! code touches the facade directly.
//!
//! Counters are monotonic; gauges (queue depth, connectivity flags, last
//! heartbeat) are set, never incremented.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use uplink_core::ServerStatus;

use crate::config::QueueNames;
use crate::delivery::DeliveryOutcome;
use crate::queue::QueueClient;

/// Per-queue monotonic counters plus the depth gauge.
#[derive(Debug, Default)]
struct QueueCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    depth: AtomicU64,
}

/// Process-wide counters and gauges, lifecycle = process lifetime.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    queues: DashMap<String, Arc<QueueCounters>>,
    deliveries_accepted: AtomicU64,
    deliveries_rejected: AtomicU64,
    deliveries_unreachable: AtomicU64,
    delivery_attempts: AtomicU64,
    auth_refreshes: AtomicU64,
    commands_executed: AtomicU64,
    commands_failed: AtomicU64,
    commands_deduped: AtomicU64,
    command_report_failures: AtomicU64,
    dead_letter_failures: AtomicU64,
    broker_up: AtomicU64,
    control_plane_up: AtomicU64,
    last_heartbeat_unix: AtomicU64,
}

impl HealthRegistry {
    /// Creates a registry with all counters zeroed and both connectivity
    /// flags down.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, logical: &str) -> Arc<QueueCounters> {
        self.queues
            .entry(logical.to_string())
            .or_default()
            .clone()
    }

    /// One message delivered and acknowledged for `logical`.
    pub fn record_processed(&self, logical: &str) {
        self.queue(logical).processed.fetch_add(1, Ordering::Relaxed);
        counter!("uplink_records_processed_total", "queue" => logical.to_string()).increment(1);
    }

    /// One message reached a terminal failure (validation or delivery).
    pub fn record_failed(&self, logical: &str) {
        self.queue(logical).failed.fetch_add(1, Ordering::Relaxed);
        counter!("uplink_records_failed_total", "queue" => logical.to_string()).increment(1);
    }

    /// One dead-letter entry written for `logical`.
    pub fn record_dead_lettered(&self, logical: &str) {
        self.queue(logical)
            .dead_lettered
            .fetch_add(1, Ordering::Relaxed);
        counter!("uplink_records_dead_lettered_total", "queue" => logical.to_string()).increment(1);
    }

    /// A dead-letter push itself failed; the message stays in its
    /// processing list for startup recovery.
    pub fn record_dead_letter_failure(&self) {
        self.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
        counter!("uplink_dead_letter_failures_total").increment(1);
    }

    /// Sets the sampled backlog depth for `logical`.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, logical: &str, depth: u64) {
        self.queue(logical).depth.store(depth, Ordering::Relaxed);
        gauge!("uplink_queue_depth", "queue" => logical.to_string()).set(depth as f64);
    }

    /// Records one finished delivery (terminal outcome plus the HTTP
    /// attempts it took).
    pub fn record_delivery(&self, outcome: &DeliveryOutcome) {
        let counter_ref = match outcome {
            DeliveryOutcome::Accepted { .. } => &self.deliveries_accepted,
            DeliveryOutcome::Rejected { .. } => &self.deliveries_rejected,
            DeliveryOutcome::Unreachable { .. } => &self.deliveries_unreachable,
        };
        counter_ref.fetch_add(1, Ordering::Relaxed);
        self.delivery_attempts
            .fetch_add(u64::from(outcome.attempts()), Ordering::Relaxed);
        counter!("uplink_deliveries_total", "result" => outcome.label()).increment(1);
        counter!("uplink_delivery_attempts_total").increment(u64::from(outcome.attempts()));
    }

    /// One bearer-token re-authentication completed.
    pub fn record_auth_refresh(&self) {
        self.auth_refreshes.fetch_add(1, Ordering::Relaxed);
        counter!("uplink_auth_refreshes_total").increment(1);
    }

    /// One command handler ran to completion.
    pub fn record_command(&self, success: bool) {
        if success {
            self.commands_executed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }
        let result = if success { "ok" } else { "error" };
        counter!("uplink_commands_total", "result" => result).increment(1);
    }

    /// A duplicate command was answered from the recently-seen cache.
    pub fn record_command_deduped(&self) {
        self.commands_deduped.fetch_add(1, Ordering::Relaxed);
        counter!("uplink_commands_total", "result" => "deduped").increment(1);
    }

    /// A command result could not be reported back.
    pub fn record_command_report_failure(&self) {
        self.command_report_failures.fetch_add(1, Ordering::Relaxed);
        counter!("uplink_command_report_failures_total").increment(1);
    }

    /// Flags broker connectivity.
    pub fn set_broker_up(&self, up: bool) {
        self.broker_up.store(u64::from(up), Ordering::Relaxed);
        gauge!("uplink_broker_up").set(if up { 1.0 } else { 0.0 });
    }

    /// Flags control-plane connectivity.
    pub fn set_control_plane_up(&self, up: bool) {
        self.control_plane_up.store(u64::from(up), Ordering::Relaxed);
        gauge!("uplink_control_plane_up").set(if up { 1.0 } else { 0.0 });
    }

    /// Records a successfully acknowledged heartbeat.
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn mark_heartbeat(&self, at: DateTime<Utc>) {
        let unix = at.timestamp().max(0) as u64;
        self.last_heartbeat_unix.store(unix, Ordering::Relaxed);
        gauge!("uplink_last_heartbeat_seconds").set(unix as f64);
    }

    /// Coarse health: online only when both dependencies are reachable.
    #[must_use]
    pub fn server_status(&self) -> ServerStatus {
        let broker = self.broker_up.load(Ordering::Relaxed) == 1;
        let control_plane = self.control_plane_up.load(Ordering::Relaxed) == 1;
        if broker && control_plane {
            ServerStatus::Online
        } else {
            ServerStatus::Degraded
        }
    }

    /// Point-in-time copy of everything, for the health endpoint and the
    /// `report_status` command.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let queues = self
            .queues
            .iter()
            .map(|entry| {
                let counters = entry.value();
                (
                    entry.key().clone(),
                    QueueSnapshot {
                        processed: counters.processed.load(Ordering::Relaxed),
                        failed: counters.failed.load(Ordering::Relaxed),
                        dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
                        depth: counters.depth.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        let last_heartbeat_unix = self.last_heartbeat_unix.load(Ordering::Relaxed);
        RegistrySnapshot {
            queues,
            deliveries: DeliverySnapshot {
                accepted: self.deliveries_accepted.load(Ordering::Relaxed),
                rejected: self.deliveries_rejected.load(Ordering::Relaxed),
                unreachable: self.deliveries_unreachable.load(Ordering::Relaxed),
                attempts: self.delivery_attempts.load(Ordering::Relaxed),
                auth_refreshes: self.auth_refreshes.load(Ordering::Relaxed),
            },
            commands: CommandSnapshot {
                executed: self.commands_executed.load(Ordering::Relaxed),
                failed: self.commands_failed.load(Ordering::Relaxed),
                deduped: self.commands_deduped.load(Ordering::Relaxed),
                report_failures: self.command_report_failures.load(Ordering::Relaxed),
            },
            dead_letter_failures: self.dead_letter_failures.load(Ordering::Relaxed),
            broker_up: self.broker_up.load(Ordering::Relaxed) == 1,
            control_plane_up: self.control_plane_up.load(Ordering::Relaxed) == 1,
            last_heartbeat: (last_heartbeat_unix > 0)
                .then(|| DateTime::from_timestamp(i64::try_from(last_heartbeat_unix).unwrap_or(0), 0))
                .flatten(),
        }
    }
}

/// Read-only view of one queue's counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    /// Messages delivered and acknowledged.
    pub processed: u64,
    /// Messages that reached a terminal failure.
    pub failed: u64,
    /// Dead-letter entries written.
    pub dead_lettered: u64,
    /// Last sampled backlog depth.
    pub depth: u64,
}

/// Read-only view of delivery counters.
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySnapshot {
    /// Deliveries that ended accepted.
    pub accepted: u64,
    /// Deliveries rejected by the control plane.
    pub rejected: u64,
    /// Deliveries that exhausted the retry budget.
    pub unreachable: u64,
    /// Total HTTP attempts across all deliveries.
    pub attempts: u64,
    /// Bearer-token re-authentications.
    pub auth_refreshes: u64,
}

/// Read-only view of command counters.
#[derive(Debug, Clone, Serialize)]
pub struct CommandSnapshot {
    /// Handlers that completed successfully.
    pub executed: u64,
    /// Handlers that returned an error.
    pub failed: u64,
    /// Duplicates answered from the cache.
    pub deduped: u64,
    /// Results that could not be reported back.
    pub report_failures: u64,
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// Per-queue counters keyed by logical queue name.
    pub queues: BTreeMap<String, QueueSnapshot>,
    /// Delivery counters.
    pub deliveries: DeliverySnapshot,
    /// Command counters.
    pub commands: CommandSnapshot,
    /// Dead-letter pushes that themselves failed.
    pub dead_letter_failures: u64,
    /// Broker reachable.
    pub broker_up: bool,
    /// Control plane reachable.
    pub control_plane_up: bool,
    /// Last acknowledged heartbeat, if any.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Samples backlog depth for every queue on an interval until shutdown.
///
/// A sampling error flips the broker flag down; the next successful pass
/// flips it back up. Runs as its own task so a slow broker never blocks
/// the consumers' pop loops.
pub async fn run_depth_sampler(
    client: Arc<QueueClient>,
    registry: Arc<HealthRegistry>,
    queues: QueueNames,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut all_ok = true;
                for (logical, broker_name) in queues.all() {
                    match client.depth(broker_name).await {
                        Ok(depth) => registry.set_queue_depth(logical, depth),
                        Err(err) => {
                            all_ok = false;
                            warn!("depth sample failed for queue {}: {}", logical, err);
                        }
                    }
                }
                registry.set_broker_up(all_ok);
            }
            _ = shutdown_rx.changed() => {
                debug!("depth sampler stopping");
                break;
            }
        }
    }
}
