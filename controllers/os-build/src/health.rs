//! Health, readiness and metrics endpoints.

use crate::metrics::Metrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state behind the endpoints
#[derive(Debug, Clone)]
pub struct HealthState {
    /// Set once the caches have synced
    pub ready: Arc<AtomicBool>,
    pub metrics: Arc<Metrics>,
}

impl HealthState {
    #[must_use]
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

async fn readyz(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

async fn metrics(State(state): State<HealthState>) -> Result<String, (StatusCode, String)> {
    state
        .metrics
        .encode()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Build the router for `/healthz`, `/readyz` and `/metrics`
pub fn health_routes(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the endpoints on `addr` until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, state: HealthState, shutdown: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => {
            info!("Health server listening on {}", addr);
            l
        }
        Err(e) => {
            error!("Failed to bind health server on {}: {}", addr, e);
            return;
        }
    };
    let server = axum::serve(listener, health_routes(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = server.await {
        error!("Health server error: {}", e);
    }
}
