//! Health, readiness and metrics endpoints.
//!
//! - `GET /healthz`: 200 while the process runs
//! - `GET /readyz`: 200 once every cache synced and its watch is healthy, else 503
//! - `GET /metrics`: Prometheus text exposition

use crate::cache::CacheStatus;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state of the probe handlers
#[derive(Clone)]
pub struct ProbeState {
    caches: Arc<[Arc<dyn CacheStatus>]>,
    metrics: Arc<Metrics>,
}

impl ProbeState {
    /// Creates state reporting on `caches`
    pub fn new(caches: Vec<Arc<dyn CacheStatus>>, metrics: Arc<Metrics>) -> Self {
        Self { caches: caches.into(), metrics }
    }
}

/// Router serving `/healthz` and `/readyz`
pub fn health_router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Router serving `/metrics`
pub fn metrics_router(state: ProbeState) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, String) {
    let waiting: Vec<String> = state
        .caches
        .iter()
        .filter_map(|cache| {
            if !cache.has_synced() {
                Some(format!("{}: not synced", cache.name()))
            } else if !cache.is_healthy() {
                Some(format!("{}: watch failing", cache.name()))
            } else {
                None
            }
        })
        .collect();
    if waiting.is_empty() {
        (StatusCode::OK, "ready".to_string())
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, waiting.join("\n"))
    }
}

async fn metrics_handler(State(state): State<ProbeState>) -> Result<Response, (StatusCode, String)> {
    let body = state
        .metrics
        .render(&state.caches)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body).into_response())
}

/// Serves `router` on `addr` until `cancel` fires
pub async fn serve(addr: SocketAddr, router: Router, cancel: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "probe server listening");
    axum::serve(listener, router.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

/// Serves the health and metrics routers, sharing one listener when the addresses match
pub async fn serve_all(
    health_addr: SocketAddr,
    metrics_addr: SocketAddr,
    state: ProbeState,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    if health_addr == metrics_addr {
        let router = health_router(state.clone()).merge(metrics_router(state));
        return serve(health_addr, router, cancel).await;
    }
    tokio::try_join!(
        serve(health_addr, health_router(state.clone()), cancel.clone()),
        serve(metrics_addr, metrics_router(state), cancel),
    )?;
    Ok(())
}
