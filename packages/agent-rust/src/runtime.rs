//! Agent assembly and lifecycle.
//!
//! Follows the deferred startup pattern: `connect()` builds the shared
//! resources, `start()` recovers processing lists and spawns the worker
//! set, `shutdown()` drains and joins. The health server is wired in by
//! the binary from `app_state()` so it can outlive a failed start and
//! still answer probes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::CommandProcessor;
use crate::config::AgentConfig;
use crate::consumer::{
    ConsumerWorker, DeadLetterSink, Enricher, QueuePipeline, QuotaPipeline, SessionPipeline,
    UsagePipeline,
};
use crate::delivery::ControlPlaneClient;
use crate::heartbeat::HeartbeatWorker;
use crate::http::AppState;
use crate::metrics::{run_depth_sampler, HealthRegistry};
use crate::queue::QueueClient;
use crate::shutdown::ShutdownController;

/// Queue depth sampling interval.
const DEPTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// The assembled agent: broker connection, delivery client, worker tasks.
pub struct Agent {
    config: AgentConfig,
    queue_client: Arc<QueueClient>,
    control_plane: Arc<ControlPlaneClient>,
    registry: Arc<HealthRegistry>,
    shutdown: Arc<ShutdownController>,
    start_time: Instant,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Connects to the broker and builds the shared resources without
    /// starting any worker.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker connection or the control-plane
    /// HTTP client cannot be built.
    pub async fn connect(config: AgentConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(HealthRegistry::new());
        let queue_client = Arc::new(QueueClient::connect(&config.broker.url).await?);
        registry.set_broker_up(true);

        let control_plane = Arc::new(ControlPlaneClient::new(
            &config.control_plane,
            &config.identity,
            Arc::clone(&registry),
        )?);

        info!(
            "connected to broker at {} for server {}",
            config.broker.url, config.identity.server_id
        );
        Ok(Self {
            config,
            queue_client,
            control_plane,
            registry,
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
            tasks: Vec::new(),
        })
    }

    /// Shared lifecycle handle, for signal wiring in the binary.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// State for the health router.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState {
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        }
    }

    /// Recovers processing lists, then spawns the worker set and flips
    /// the agent to ready.
    ///
    /// # Errors
    ///
    /// Returns an error when startup recovery fails; the agent must not
    /// consume ahead of unrecovered in-flight messages.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        for queue in [
            &self.config.queues.usage,
            &self.config.queues.session_lifecycle,
            &self.config.queues.quota_refresh,
        ] {
            let recovered = self.queue_client.recover_processing(queue).await?;
            if recovered > 0 {
                info!("recovered {} in-flight message(s) on {}", recovered, queue);
            }
        }

        let sink = Arc::new(DeadLetterSink::new(
            Arc::clone(&self.queue_client),
            self.config.queues.dead_letter.clone(),
            Arc::clone(&self.registry),
        ));

        let pipelines: [Arc<dyn QueuePipeline>; 3] = [
            Arc::new(UsagePipeline::new(
                self.config.queues.usage.clone(),
                Enricher::new(&self.config.identity),
                Arc::clone(&self.control_plane),
                Arc::clone(&self.registry),
            )),
            Arc::new(SessionPipeline::new(
                self.config.queues.session_lifecycle.clone(),
                Arc::clone(&self.control_plane),
                Arc::clone(&self.registry),
            )),
            Arc::new(QuotaPipeline::new(
                self.config.queues.quota_refresh.clone(),
                self.config.queues.quota_response.clone(),
                Arc::clone(&self.control_plane),
                Arc::clone(&self.queue_client),
                Arc::clone(&self.registry),
            )),
        ];
        for pipeline in pipelines {
            let worker = ConsumerWorker::new(
                pipeline,
                Arc::clone(&self.queue_client),
                Arc::clone(&sink),
                Arc::clone(&self.registry),
                Arc::clone(&self.shutdown),
                &self.config.broker,
            );
            self.tasks.push(tokio::spawn(worker.run()));
        }

        let commands = CommandProcessor::new(
            Arc::clone(&self.control_plane),
            Arc::clone(&self.queue_client),
            Arc::clone(&self.registry),
            Arc::clone(&self.shutdown),
            self.config.queues.clone(),
            &self.config.commands,
            self.config.identity.version.clone(),
        );
        self.tasks.push(tokio::spawn(commands.run()));

        let heartbeat = HeartbeatWorker::new(
            Arc::clone(&self.control_plane),
            Arc::clone(&self.registry),
            Arc::clone(&self.shutdown),
            self.config.identity.clone(),
            &self.config.heartbeat,
        );
        self.tasks.push(tokio::spawn(heartbeat.run()));

        self.tasks.push(tokio::spawn(run_depth_sampler(
            Arc::clone(&self.queue_client),
            Arc::clone(&self.registry),
            self.config.queues.clone(),
            DEPTH_SAMPLE_INTERVAL,
            self.shutdown.shutdown_receiver(),
        )));

        self.shutdown.set_ready();
        info!("agent ready; {} worker task(s) running", self.tasks.len());
        Ok(())
    }

    /// Graceful shutdown: signal every worker, wait for held messages,
    /// join the tasks.
    ///
    /// Returns `true` when everything drained within the grace period.
    /// On `false`, workers are aborted and their unacknowledged messages
    /// stay in processing lists for the next startup's recovery.
    pub async fn shutdown(mut self) -> bool {
        info!(
            "shutting down; waiting up to {:?} for in-flight messages",
            self.config.shutdown_grace
        );
        self.shutdown.trigger_shutdown();
        let drained = self.shutdown.wait_for_drain(self.config.shutdown_grace).await;

        if drained {
            for result in join_all(self.tasks.drain(..)).await {
                if let Err(err) = result {
                    warn!("worker task ended abnormally: {}", err);
                }
            }
            info!("shutdown complete");
        } else {
            warn!(
                "grace period expired with {} message(s) in flight; aborting workers",
                self.shutdown.in_flight_count()
            );
            for task in self.tasks.drain(..) {
                task.abort();
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::StatusCode;
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use serde_json::json;

    use crate::delivery::RetryPolicy;
    use crate::shutdown::AgentState;

    const VALID_RECORD: &[u8] = br#"{"transaction_id":"t1","user_id":"u1","product_code":"STT","usage_amount":100,"timestamp":"2024-01-01T00:00:00Z"}"#;

    fn test_config(addr: SocketAddr) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.identity.server_id = "dp-1".to_string();
        config.identity.region = "eu-west-1".to_string();
        config.broker.url = "memory://".to_string();
        config.broker.pop_timeout = Duration::from_millis(100);
        config.control_plane.base_url = format!("http://{addr}");
        config.control_plane.api_key = "key".to_string();
        config.control_plane.retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
        };
        config.commands.poll_interval = Duration::from_millis(100);
        config.heartbeat.interval = Duration::from_millis(50);
        config.shutdown_grace = Duration::from_secs(2);
        config
    }

    fn stub_app(usage_calls: &Arc<AtomicUsize>) -> Router {
        let usage_calls = Arc::clone(usage_calls);
        Router::new()
            .route(
                "/api/v1/auth/token",
                post(|| async { Json(json!({ "token": "tok-1" })) }),
            )
            .route(
                "/api/v1/usage-records",
                post(move || {
                    let calls = Arc::clone(&usage_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/api/v1/servers/register",
                post(|| async { StatusCode::OK }),
            )
            .route(
                "/api/v1/servers/{server_id}/heartbeat",
                put(|| async { StatusCode::OK }),
            )
            .route(
                "/api/v1/servers/{server_id}/commands",
                get(|| async { Json(json!([])) }),
            )
            .route(
                "/api/v1/servers/{server_id}/command-results",
                post(|| async { StatusCode::OK }),
            )
    }

    async fn spawn_stub(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    async fn wait_for_calls(calls: &AtomicUsize, minimum: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while calls.load(Ordering::SeqCst) < minimum {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {minimum} call(s), saw {}",
                calls.load(Ordering::SeqCst)
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn agent_delivers_pushed_records_and_drains_on_shutdown() {
        let usage_calls = Arc::new(AtomicUsize::new(0));
        let addr = spawn_stub(stub_app(&usage_calls)).await;

        let mut agent = Agent::connect(test_config(addr)).await.expect("connect");
        assert_eq!(agent.shutdown.state(), AgentState::Starting);

        agent
            .queue_client
            .push(&agent.config.queues.usage, VALID_RECORD)
            .await
            .expect("push");

        agent.start().await.expect("start");
        assert_eq!(agent.shutdown.state(), AgentState::Ready);

        wait_for_calls(&usage_calls, 1).await;

        let drained = agent.shutdown().await;
        assert!(drained);
    }

    #[tokio::test]
    async fn startup_recovery_replays_unacknowledged_messages() {
        let usage_calls = Arc::new(AtomicUsize::new(0));
        let addr = spawn_stub(stub_app(&usage_calls)).await;

        let mut agent = Agent::connect(test_config(addr)).await.expect("connect");

        // Simulate a crash mid-message: the payload sits in the processing
        // list, not the source queue.
        let processing = QueueClient::processing_name(&agent.config.queues.usage);
        agent
            .queue_client
            .push(&processing, VALID_RECORD)
            .await
            .expect("push");

        agent.start().await.expect("start");
        wait_for_calls(&usage_calls, 1).await;

        let drained = agent.shutdown().await;
        assert!(drained);
    }
}
