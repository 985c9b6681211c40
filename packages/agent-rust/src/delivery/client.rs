//! HTTP client for the control plane.
//!
//! One client instance is shared by every worker. Deliveries run through
//! the retry machine in [`super::retry`]; the bearer token is shared
//! read-mostly state refreshed under a single-writer discipline, so
//! concurrent 401s trigger one token exchange, not a stampede.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use uplink_core::{
    CommandResult, EnrichedUsageRecord, Heartbeat, QuotaRefreshRequest, QuotaRefreshResponse,
    ServerRegistration, SessionLifecycleEvent,
};

use crate::config::{ControlPlaneConfig, ServerIdentity};
use crate::metrics::HealthRegistry;

use super::classify::{classify_response, classify_transport_error, OutcomeClass};
use super::retry::{DeliveryAttempt, NextStep, RetryPolicy};
use super::{DeliveryError, DeliveryOutcome};

const CORRELATION_HEADER: &str = "x-correlation-id";

/// Reply body of `POST /api/v1/auth/token`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Bearer token plus the coordination state for refreshing it.
#[derive(Default)]
struct AuthState {
    token: ArcSwapOption<String>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

/// Client for every control-plane endpoint the agent talks to.
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    server_id: String,
    api_key: String,
    policy: RetryPolicy,
    auth: AuthState,
    public_keys: ArcSwapOption<Value>,
    registry: Arc<HealthRegistry>,
}

impl ControlPlaneClient {
    /// Builds the client and its connection pool. No network traffic
    /// happens here; the first token exchange is lazy.
    ///
    /// # Errors
    /// Fails only if the underlying HTTP client cannot be constructed.
    pub fn new(
        config: &ControlPlaneConfig,
        identity: &ServerIdentity,
        registry: Arc<HealthRegistry>,
    ) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("uplink-agent/{}", identity.version))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            server_id: identity.server_id.clone(),
            api_key: config.api_key.clone(),
            policy: config.retry.clone(),
            auth: AuthState::default(),
            public_keys: ArcSwapOption::empty(),
            registry,
        })
    }

    // -----------------------------------------------------------------------
    // Record deliveries
    // -----------------------------------------------------------------------

    /// Delivers one enriched usage record.
    pub async fn submit_usage(
        &self,
        record: &EnrichedUsageRecord,
        correlation_id: &str,
    ) -> DeliveryOutcome {
        self.deliver_json(
            Method::POST,
            "/api/v1/usage-records",
            record,
            correlation_id,
        )
        .await
    }

    /// Delivers one session lifecycle event. The event type is part of the
    /// path, mirroring how upstream servers address session transitions.
    pub async fn send_session_event(
        &self,
        event: &SessionLifecycleEvent,
        correlation_id: &str,
    ) -> DeliveryOutcome {
        let path = format!(
            "/api/v1/sessions/{}/{}",
            event.session_id,
            event.event_type.as_str()
        );
        self.deliver_json(Method::POST, &path, event, correlation_id)
            .await
    }

    /// Forwards a quota refresh request and, when the control plane
    /// grants one, returns the parsed grant for the response queue.
    ///
    /// A 2xx reply whose body does not parse as a grant is a rejection:
    /// retrying cannot fix a malformed answer.
    pub async fn refresh_quota(
        &self,
        request: &QuotaRefreshRequest,
        correlation_id: &str,
    ) -> (DeliveryOutcome, Option<QuotaRefreshResponse>) {
        let body = match serde_json::to_value(request) {
            Ok(body) => body,
            Err(err) => {
                return (
                    DeliveryOutcome::Rejected {
                        reason: format!("unserializable payload: {err}"),
                        attempts: 0,
                    },
                    None,
                );
            }
        };
        let (outcome, payload) = self
            .run_delivery(
                &Method::POST,
                "/api/v1/quota/refresh",
                Some(&body),
                correlation_id,
            )
            .await;
        if !outcome.is_accepted() {
            return (outcome, None);
        }
        let attempts = outcome.attempts();
        match payload.as_deref().map(serde_json::from_slice) {
            Some(Ok(grant)) => (outcome, Some(grant)),
            Some(Err(err)) => (
                DeliveryOutcome::Rejected {
                    reason: format!("malformed quota response: {err}"),
                    attempts,
                },
                None,
            ),
            None => (
                DeliveryOutcome::Rejected {
                    reason: "missing quota response body".to_string(),
                    attempts,
                },
                None,
            ),
        }
    }

    /// Reports one command execution result.
    pub async fn report_command_result(
        &self,
        result: &CommandResult,
        correlation_id: &str,
    ) -> DeliveryOutcome {
        let path = format!("/api/v1/servers/{}/command-results", self.server_id);
        self.deliver_json(Method::POST, &path, result, correlation_id)
            .await
    }

    /// Announces this agent to the control plane.
    pub async fn register_server(
        &self,
        registration: &ServerRegistration,
        correlation_id: &str,
    ) -> DeliveryOutcome {
        self.deliver_json(
            Method::POST,
            "/api/v1/servers/register",
            registration,
            correlation_id,
        )
        .await
    }

    /// Sends one heartbeat.
    pub async fn send_heartbeat(
        &self,
        heartbeat: &Heartbeat,
        correlation_id: &str,
    ) -> DeliveryOutcome {
        let path = format!("/api/v1/servers/{}/heartbeat", self.server_id);
        self.deliver_json(Method::PUT, &path, heartbeat, correlation_id)
            .await
    }

    // -----------------------------------------------------------------------
    // Query-style calls
    // -----------------------------------------------------------------------

    /// Fetches pending remote commands as raw JSON values. Decoding is
    /// per-element on the caller's side, so one malformed command cannot
    /// poison the rest of the batch.
    ///
    /// # Errors
    /// Terminal delivery failure, or a reply that is not a JSON array.
    pub async fn poll_commands(&self, correlation_id: &str) -> Result<Vec<Value>, DeliveryError> {
        let path = format!("/api/v1/servers/{}/commands", self.server_id);
        let (outcome, payload) = self
            .run_delivery(&Method::GET, &path, None, correlation_id)
            .await;
        match outcome {
            DeliveryOutcome::Accepted { .. } => {
                let commands: Vec<Value> = serde_json::from_slice(&payload.unwrap_or_default())?;
                Ok(commands)
            }
            DeliveryOutcome::Rejected { reason, .. }
            | DeliveryOutcome::Unreachable {
                last_error: reason, ..
            } => Err(DeliveryError::Failed(reason)),
        }
    }

    /// Fetches the current public signing keys and replaces the cached
    /// document.
    ///
    /// # Errors
    /// Terminal delivery failure, or a reply that is not valid JSON.
    pub async fn fetch_public_keys(&self, correlation_id: &str) -> Result<Arc<Value>, DeliveryError> {
        let (outcome, payload) = self
            .run_delivery(&Method::GET, "/api/v1/auth/public-keys", None, correlation_id)
            .await;
        match outcome {
            DeliveryOutcome::Accepted { .. } => {
                let document: Value = serde_json::from_slice(&payload.unwrap_or_default())?;
                let document = Arc::new(document);
                self.public_keys.store(Some(Arc::clone(&document)));
                Ok(document)
            }
            DeliveryOutcome::Rejected { reason, .. }
            | DeliveryOutcome::Unreachable {
                last_error: reason, ..
            } => Err(DeliveryError::Failed(reason)),
        }
    }

    /// Most recently fetched public-key document, if any.
    #[must_use]
    pub fn cached_public_keys(&self) -> Option<Arc<Value>> {
        self.public_keys.load_full()
    }

    /// Single-shot liveness probe against the control plane. No retries:
    /// callers poll this on their own schedule.
    ///
    /// # Errors
    /// Transport failure or a non-2xx status.
    pub async fn check_health(&self) -> Result<(), DeliveryError> {
        let response = self
            .http
            .get(self.endpoint("/api/v1/health"))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Failed(format!("status {status}")))
        }
    }

    // -----------------------------------------------------------------------
    // Delivery core
    // -----------------------------------------------------------------------

    async fn deliver_json<T: serde::Serialize>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        correlation_id: &str,
    ) -> DeliveryOutcome {
        let body = match serde_json::to_value(payload) {
            Ok(body) => body,
            Err(err) => {
                return DeliveryOutcome::Rejected {
                    reason: format!("unserializable payload: {err}"),
                    attempts: 0,
                };
            }
        };
        self.run_delivery(&method, path, Some(&body), correlation_id)
            .await
            .0
    }

    /// Drives one payload through the retry machine until terminal. The
    /// response body is returned only for accepted deliveries.
    async fn run_delivery(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        correlation_id: &str,
    ) -> (DeliveryOutcome, Option<Bytes>) {
        let mut machine = DeliveryAttempt::new(self.policy.clone());
        loop {
            let (class, payload) = match self.ensure_token().await {
                Ok(token) => {
                    self.send_once(method, path, body, correlation_id, &token)
                        .await
                }
                Err(err) => (
                    OutcomeClass::Transient {
                        retry_after: None,
                        reason: format!("authentication request failed: {err}"),
                    },
                    None,
                ),
            };
            if let OutcomeClass::Transient { reason, .. } = &class {
                warn!(
                    "delivery attempt {} to {} failed: {}",
                    machine.attempts() + 1,
                    path,
                    reason
                );
            }
            match machine.record(class) {
                NextStep::Done(outcome) => {
                    if outcome.is_accepted() {
                        return (outcome, payload);
                    }
                    return (outcome, None);
                }
                NextStep::Reauthenticate => {
                    debug!("bearer token rejected for {}; refreshing once", path);
                    self.invalidate_token();
                }
                NextStep::Backoff(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// One HTTP call, classified. The body is captured only on success.
    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        correlation_id: &str,
        token: &str,
    ) -> (OutcomeClass, Option<Bytes>) {
        let mut request = self
            .http
            .request(method.clone(), self.endpoint(path))
            .bearer_auth(token)
            .header(CORRELATION_HEADER, correlation_id);
        if let Some(body) = body {
            request = request.json(body);
        }
        match request.send().await {
            Ok(response) => {
                let class = classify_response(response.status(), response.headers());
                if class == OutcomeClass::Success {
                    match response.bytes().await {
                        Ok(payload) => (OutcomeClass::Success, Some(payload)),
                        // Connection dropped mid-body: same as any other
                        // transport failure.
                        Err(err) => (classify_transport_error(&err), None),
                    }
                } else {
                    (class, None)
                }
            }
            Err(err) => (classify_transport_error(&err), None),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    async fn ensure_token(&self) -> Result<Arc<String>, DeliveryError> {
        if let Some(token) = self.auth.token.load_full() {
            return Ok(token);
        }
        self.refresh_token().await
    }

    fn invalidate_token(&self) {
        self.auth.token.store(None);
    }

    /// Exchanges the API key for a fresh bearer token. Single-flight:
    /// callers that queued behind an in-progress refresh reuse its result
    /// instead of issuing their own exchange.
    async fn refresh_token(&self) -> Result<Arc<String>, DeliveryError> {
        let seen = self.auth.generation.load(Ordering::Acquire);
        let _guard = self.auth.refresh_lock.lock().await;
        if self.auth.generation.load(Ordering::Acquire) != seen {
            if let Some(token) = self.auth.token.load_full() {
                return Ok(token);
            }
        }

        let body = serde_json::json!({
            "server_id": self.server_id,
            "api_key": self.api_key,
        });
        let response = self
            .http
            .post(self.endpoint("/api/v1/auth/token"))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Auth(format!(
                "token endpoint returned status {status}"
            )));
        }
        let token_response: TokenResponse = response.json().await?;

        let token = Arc::new(token_response.token);
        self.auth.token.store(Some(Arc::clone(&token)));
        self.auth.generation.fetch_add(1, Ordering::Release);
        self.registry.record_auth_refresh();
        info!("bearer token refreshed");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::json;

    use uplink_core::{ProductCode, UsageRecord};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    fn test_client(addr: SocketAddr, max_attempts: u32) -> ControlPlaneClient {
        let config = ControlPlaneConfig {
            base_url: format!("http://{addr}"),
            api_key: "test-key".to_string(),
            request_timeout: Duration::from_secs(5),
            retry: fast_policy(max_attempts),
        };
        let identity = ServerIdentity {
            server_id: "dp-1".to_string(),
            region: "us-east-1".to_string(),
            ..ServerIdentity::default()
        };
        ControlPlaneClient::new(&config, &identity, Arc::new(HealthRegistry::new()))
            .expect("client builds")
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

    fn token_route() -> Router {
        Router::new().route(
            "/api/v1/auth/token",
            post(|| async { Json(json!({ "token": "tok-1" })) }),
        )
    }

    fn enriched_record() -> EnrichedUsageRecord {
        EnrichedUsageRecord {
            record: UsageRecord {
                transaction_id: "t1".to_string(),
                user_id: "u1".to_string(),
                product_code: ProductCode::SpeechToText,
                usage_amount: 100,
                timestamp: Utc::now(),
            },
            server_id: "dp-1".to_string(),
            server_region: "us-east-1".to_string(),
            processed_at: Utc::now(),
            agent_version: "0.1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn accepted_after_transient_failures_counts_every_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let saw_correlation = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handler_calls = Arc::clone(&calls);
        let handler_corr = Arc::clone(&saw_correlation);
        let app = token_route().route(
            "/api/v1/usage-records",
            post(move |headers: HeaderMap| {
                let calls = Arc::clone(&handler_calls);
                let corr = Arc::clone(&handler_corr);
                async move {
                    if headers.contains_key("x-correlation-id") {
                        corr.store(true, Ordering::SeqCst);
                    }
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 5);

        let outcome = client.submit_usage(&enriched_record(), "corr-1").await;

        assert_eq!(outcome, DeliveryOutcome::Accepted { attempts: 4 });
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(saw_correlation.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn exhaustion_returns_unreachable_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let app = token_route().route(
            "/api/v1/usage-records",
            post(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 3);

        let outcome = client.submit_usage(&enriched_record(), "corr-2").await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match outcome {
            DeliveryOutcome::Unreachable {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("503"));
            }
            other => panic!("expected unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_error_rejects_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let app = token_route().route(
            "/api/v1/usage-records",
            post(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::UNPROCESSABLE_ENTITY
                }
            }),
        );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 5);

        let outcome = client.submit_usage(&enriched_record(), "corr-3").await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match outcome {
            DeliveryOutcome::Rejected { reason, attempts } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("422"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_token_refreshed_once_and_delivery_succeeds() {
        let token_calls = Arc::new(AtomicUsize::new(0));
        let handler_tokens = Arc::clone(&token_calls);
        let app = Router::new()
            .route(
                "/api/v1/auth/token",
                post(move || {
                    let tokens = Arc::clone(&handler_tokens);
                    async move {
                        let n = tokens.fetch_add(1, Ordering::SeqCst) + 1;
                        Json(json!({ "token": format!("tok-{n}") }))
                    }
                }),
            )
            .route(
                "/api/v1/usage-records",
                post(|headers: HeaderMap| async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        == Some("Bearer tok-2");
                    if authorized {
                        StatusCode::OK
                    } else {
                        StatusCode::UNAUTHORIZED
                    }
                }),
            );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 5);

        let outcome = client.submit_usage(&enriched_record(), "corr-4").await;

        // tok-1 is rejected once, the refreshed tok-2 is accepted.
        assert_eq!(outcome, DeliveryOutcome::Accepted { attempts: 2 });
        assert_eq!(token_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn quota_grant_is_parsed_from_accepted_reply() {
        let app = token_route().route(
            "/api/v1/quota/refresh",
            post(|| async {
                Json(json!({
                    "transaction_id": "t2",
                    "user_id": "u1",
                    "granted_amount": 500,
                    "final_grant": true,
                    "timestamp": "2024-01-01T00:00:00Z",
                }))
            }),
        );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 5);
        let request = QuotaRefreshRequest {
            transaction_id: "t2".to_string(),
            user_id: "u1".to_string(),
            session_id: None,
            product_code: None,
            requested_amount: Some(500),
            requested_at: Utc::now(),
        };

        let (outcome, grant) = client.refresh_quota(&request, "corr-5").await;

        assert!(outcome.is_accepted());
        let grant = grant.expect("grant parsed");
        assert_eq!(grant.granted_amount, 500);
        assert!(grant.final_grant);
    }

    #[tokio::test]
    async fn malformed_quota_reply_rejects_without_retry() {
        let app = token_route().route(
            "/api/v1/quota/refresh",
            post(|| async { Json(json!({ "unexpected": true })) }),
        );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 5);
        let request = QuotaRefreshRequest {
            transaction_id: "t3".to_string(),
            user_id: "u1".to_string(),
            session_id: None,
            product_code: None,
            requested_amount: None,
            requested_at: Utc::now(),
        };

        let (outcome, grant) = client.refresh_quota(&request, "corr-6").await;

        assert!(grant.is_none());
        match outcome {
            DeliveryOutcome::Rejected { reason, attempts } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("malformed quota response"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_commands_returns_raw_elements() {
        let app = token_route().route(
            "/api/v1/servers/{server_id}/commands",
            get(|| async {
                Json(json!([
                    { "command_id": "c1", "command_type": "health_check", "issued_at": "2024-01-01T00:00:00Z" },
                    { "command_id": "c2" },
                ]))
            }),
        );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 5);

        let commands = client.poll_commands("corr-7").await.expect("poll");

        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0]["command_id"], "c1");
    }

    #[tokio::test]
    async fn fetched_public_keys_are_cached() {
        let app = token_route().route(
            "/api/v1/auth/public-keys",
            get(|| async { Json(json!({ "keys": [{ "kid": "k1" }] })) }),
        );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 5);
        assert!(client.cached_public_keys().is_none());

        let document = client.fetch_public_keys("corr-8").await.expect("fetch");

        assert_eq!(document["keys"][0]["kid"], "k1");
        let cached = client.cached_public_keys().expect("cached");
        assert_eq!(cached["keys"][0]["kid"], "k1");
    }

    #[tokio::test]
    async fn session_event_path_includes_event_type() {
        let app = token_route().route(
            "/api/v1/sessions/{session_id}/start",
            post(|| async { StatusCode::OK }),
        );
        let addr = spawn_stub(app).await;
        let client = test_client(addr, 2);

        let event = uplink_core::SessionLifecycleEvent {
            session_id: "s1".to_string(),
            event_type: uplink_core::SessionEventType::Start,
            timestamp: Utc::now(),
            metadata: None,
        };
        let outcome = client.send_session_event(&event, "corr-9").await;
        assert!(outcome.is_accepted());

        // An event type with no matching route 404s and is rejected.
        let event = uplink_core::SessionLifecycleEvent {
            event_type: uplink_core::SessionEventType::Error,
            ..event
        };
        let outcome = client.send_session_event(&event, "corr-10").await;
        assert!(matches!(outcome, DeliveryOutcome::Rejected { .. }));
    }
}
