//! The agent's own HTTP surface: health and probe endpoints.
//!
//! The Prometheus scrape endpoint is served separately by the exporter
//! (see `main.rs`); this router only carries health and probes.

mod health;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::HealthRegistry;
use crate::shutdown::ShutdownController;

pub use health::{health_handler, liveness_handler, readiness_handler};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Counter/gauge registry backing the health report.
    pub registry: Arc<HealthRegistry>,
    /// Lifecycle state for the probes.
    pub shutdown: Arc<ShutdownController>,
    /// Process start, for the uptime field.
    pub start_time: Instant,
}

/// Assembles the health router with its middleware.
///
/// Routes:
/// - `GET /health` -- detailed health JSON
/// - `GET /health/live` -- Kubernetes liveness probe
/// - `GET /health/ready` -- Kubernetes readiness probe
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Binds and serves the health router until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server hits a
/// fatal I/O error.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("health endpoints listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
