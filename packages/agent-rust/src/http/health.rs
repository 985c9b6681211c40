//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose agent health for orchestrators (Kubernetes, load
//! balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::shutdown::AgentState;

use super::AppState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body says
/// whether the agent is actually healthy. This lets monitoring tools
/// distinguish "up but draining" or "up but degraded" from "down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "status": state.registry.server_status(),
        "state": state.shutdown.state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "metrics": snapshot,
    }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// The liveness probe only checks whether the process is running and
/// responsive. It intentionally does not check the broker or control
/// plane, because a failed liveness probe triggers a pod restart and
/// restarting the agent does not fix a down dependency.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when ready, 503 otherwise.
///
/// Returns 503 during startup (before processing-list recovery finishes)
/// and during graceful shutdown. This removes the pod from the Service's
/// endpoint list so no new traffic is routed to it.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.state() == AgentState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::metrics::HealthRegistry;
    use crate::shutdown::ShutdownController;

    fn test_state() -> AppState {
        AppState {
            registry: Arc::new(HealthRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_handler_returns_status_and_metrics() {
        let state = test_state();
        state.shutdown.set_ready();
        state.registry.set_broker_up(true);
        state.registry.set_control_plane_up(true);
        state.registry.record_processed("usage");

        let response = health_handler(State(state)).await;
        let json = response.0;

        assert_eq!(json["status"], "online");
        assert_eq!(json["state"], "ready");
        assert_eq!(json["in_flight"], 0);
        assert!(json["uptime_secs"].is_number());
        assert_eq!(json["metrics"]["queues"]["usage"]["processed"], 1);
    }

    #[tokio::test]
    async fn health_handler_reports_degraded_when_broker_down() {
        let state = test_state();
        state.shutdown.set_ready();
        state.registry.set_control_plane_up(true);

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["status"], "degraded");
    }

    #[tokio::test]
    async fn health_handler_reports_in_flight_count() {
        let state = test_state();
        let _guard = state.shutdown.in_flight_guard();

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["in_flight"], 1);
    }

    #[tokio::test]
    async fn liveness_handler_always_returns_200() {
        let status = liveness_handler().await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_handler_returns_503_when_starting() {
        let state = test_state();
        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readiness_handler_returns_200_when_ready() {
        let state = test_state();
        state.shutdown.set_ready();

        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_handler_returns_503_when_draining() {
        let state = test_state();
        state.shutdown.set_ready();
        state.shutdown.trigger_shutdown();

        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
