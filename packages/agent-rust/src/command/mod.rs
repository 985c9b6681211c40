//! Remote command polling and execution.
//!
//! The control plane queues commands per server; the agent polls for them,
//! runs the matching handler, and reports a result for every command it
//! saw. The transport is at-least-once, so a bounded recently-seen cache
//! answers duplicate `command_id`s with the original result instead of
//! running the handler again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use quick_cache::sync::Cache;
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use uplink_core::{decode_remote_command, CommandResult, CommandType, RemoteCommand};

use crate::config::{CommandConfig, QueueNames};
use crate::delivery::{ControlPlaneClient, DeliveryError};
use crate::metrics::HealthRegistry;
use crate::queue::{QueueClient, QueueError};
use crate::shutdown::ShutdownController;

/// Pause after a failed poll before trying again, well under the normal
/// poll interval so a transient outage does not delay pending commands by
/// a full cycle.
const POLL_ERROR_DELAY: Duration = Duration::from_secs(5);

/// A command handler that could not complete.
///
/// Always caught and reported as a failed [`CommandResult`]; never
/// propagated out of the poll loop.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("flush_queue requires a `queue` argument")]
    MissingQueueArgument,
    #[error("unknown queue `{0}`")]
    UnknownQueue(String),
    #[error("public key refresh failed: {0}")]
    KeyRefresh(#[source] DeliveryError),
    #[error("flush of `{queue}` failed: {source}")]
    Flush {
        queue: String,
        #[source]
        source: QueueError,
    },
}

fn component_report(result: Result<(), impl std::fmt::Display>) -> Value {
    match result {
        Ok(()) => json!({ "status": "ok" }),
        Err(err) => json!({ "status": "error", "detail": err.to_string() }),
    }
}

/// Polls the control plane for pending commands and executes them.
pub struct CommandProcessor {
    client: Arc<ControlPlaneClient>,
    queue_client: Arc<QueueClient>,
    registry: Arc<HealthRegistry>,
    shutdown: Arc<ShutdownController>,
    queues: QueueNames,
    poll_interval: Duration,
    seen: Cache<String, CommandResult>,
    started_at: Instant,
    version: String,
}

impl CommandProcessor {
    #[must_use]
    pub fn new(
        client: Arc<ControlPlaneClient>,
        queue_client: Arc<QueueClient>,
        registry: Arc<HealthRegistry>,
        shutdown: Arc<ShutdownController>,
        queues: QueueNames,
        config: &CommandConfig,
        version: String,
    ) -> Self {
        Self {
            client,
            queue_client,
            registry,
            shutdown,
            queues,
            poll_interval: config.poll_interval,
            seen: Cache::new(config.seen_cache_capacity),
            started_at: Instant::now(),
            version,
        }
    }

    /// Runs the poll loop until the shutdown signal fires. Poll failures
    /// are logged and retried; they never end the loop.
    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown.shutdown_receiver();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("command processor started (poll every {:?})", self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!("command poll failed: {}", err);
                        tokio::select! {
                            () = tokio::time::sleep(POLL_ERROR_DELAY) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("command processor stopped");
    }

    async fn poll_once(&self) -> Result<(), DeliveryError> {
        let correlation_id = Uuid::new_v4().to_string();
        let commands = self.client.poll_commands(&correlation_id).await?;
        if commands.is_empty() {
            return Ok(());
        }
        debug!("fetched {} pending command(s)", commands.len());
        for raw in commands {
            self.handle_raw(raw, &correlation_id).await;
        }
        Ok(())
    }

    /// Decodes one fetched command. An undecodable command still gets a
    /// failed result when its id is readable, so the control plane stops
    /// re-delivering it.
    async fn handle_raw(&self, raw: Value, correlation_id: &str) {
        let command_id = raw
            .get("command_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        match decode_remote_command(raw) {
            Ok(command) => self.execute(command, correlation_id).await,
            Err(err) => {
                warn!("undecodable command: {}", err);
                self.registry.record_command(false);
                if let Some(id) = command_id {
                    let result = CommandResult::failed(id, err.to_string());
                    self.report(&result, correlation_id).await;
                }
            }
        }
    }

    async fn execute(&self, command: RemoteCommand, correlation_id: &str) {
        if let Some(cached) = self.seen.get(&command.command_id) {
            debug!(
                "command {} already executed; re-reporting cached result",
                command.command_id
            );
            self.registry.record_command_deduped();
            self.report(&cached, correlation_id).await;
            return;
        }

        info!(
            "executing command {} ({})",
            command.command_id,
            command.command_type.as_str()
        );
        let result = match self.run_handler(&command, correlation_id).await {
            Ok(output) => CommandResult::succeeded(command.command_id.clone(), output),
            Err(err) => CommandResult::failed(command.command_id.clone(), err.to_string()),
        };
        self.registry.record_command(result.success);
        self.seen.insert(command.command_id.clone(), result.clone());
        self.report(&result, correlation_id).await;
    }

    async fn run_handler(
        &self,
        command: &RemoteCommand,
        correlation_id: &str,
    ) -> Result<Value, CommandError> {
        match command.command_type {
            CommandType::HealthCheck => Ok(self.health_check().await),
            CommandType::ReportStatus => Ok(self.report_status().await),
            CommandType::RefreshKeys => self.refresh_keys(correlation_id).await,
            CommandType::FlushQueue => self.flush_queue(command).await,
        }
    }

    async fn health_check(&self) -> Value {
        let broker = self.queue_client.ping().await;
        let control_plane = self.client.check_health().await;
        let healthy = broker.is_ok() && control_plane.is_ok();
        json!({
            "overall_status": if healthy { "healthy" } else { "degraded" },
            "components": {
                "broker": component_report(broker),
                "control_plane": component_report(control_plane),
            },
        })
    }

    async fn report_status(&self) -> Value {
        let snapshot = self.registry.snapshot();
        let mut depths = serde_json::Map::new();
        for (logical, broker_name) in self.queues.all() {
            let value = match self.queue_client.depth(broker_name).await {
                Ok(depth) => json!(depth),
                Err(err) => json!({ "error": err.to_string() }),
            };
            depths.insert(logical.to_string(), value);
        }
        json!({
            "status": self.registry.server_status(),
            "metrics": snapshot,
            "queue_depths": depths,
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "version": self.version,
        })
    }

    async fn refresh_keys(&self, correlation_id: &str) -> Result<Value, CommandError> {
        let keys = self
            .client
            .fetch_public_keys(correlation_id)
            .await
            .map_err(CommandError::KeyRefresh)?;
        let count = keys.get("keys").and_then(Value::as_array).map_or(0, Vec::len);
        info!("public keys refreshed ({} key(s))", count);
        Ok(json!({ "keys_refreshed": count }))
    }

    /// Drops the backlog of one logical queue. In-flight messages are not
    /// touched; they finish through their processing lists.
    async fn flush_queue(&self, command: &RemoteCommand) -> Result<Value, CommandError> {
        let Some(logical) = command.payload.get("queue").and_then(Value::as_str) else {
            return Err(CommandError::MissingQueueArgument);
        };
        let Some(broker_name) = self.queues.resolve(logical) else {
            return Err(CommandError::UnknownQueue(logical.to_string()));
        };
        let dropped = self
            .queue_client
            .purge(broker_name)
            .await
            .map_err(|source| CommandError::Flush {
                queue: logical.to_string(),
                source,
            })?;
        info!("queue {} flushed ({} message(s) dropped)", logical, dropped);
        Ok(json!({ "queue": logical, "dropped": dropped }))
    }

    async fn report(&self, result: &CommandResult, correlation_id: &str) {
        let outcome = self
            .client
            .report_command_result(result, correlation_id)
            .await;
        if !outcome.is_accepted() {
            self.registry.record_command_report_failure();
            error!(
                "result for command {} not delivered after {} attempt(s)",
                result.command_id,
                outcome.attempts()
            );
        }
    }
}
