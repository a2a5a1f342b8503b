#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-api** – the HTTP surface that sits at the api layer of the
//! supervisor tree.
//!
//! Handlers themselves are out of scope for the core pipeline, but the
//! supervisor tree names an api-layer child that must exist as a
//! concrete [`cg_supervisor::Service`]; this crate is that service. It
//! exposes three endpoints: `/healthz` (process is up),
//! `/readyz` (dependencies report healthy), and `/metrics` (Prometheus
//! text exposition via [`cg_metrics::PrometheusMetricsSink`]).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use cg_metrics::PrometheusMetricsSink;
use cg_supervisor::{Service, ServiceOutcome};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Something this surface can ask "are you ready" — e.g. a WAL, a store,
/// a bus connection. Handlers are out of scope, but the readiness
/// contract a handler would need is not: it is the seam through which
/// `/readyz` reports real dependency health instead of always `200 OK`.
pub trait ReadinessCheck: Send + Sync {
    /// A short name for this dependency, used in the readiness report.
    fn name(&self) -> &str;
    /// Whether this dependency currently considers itself healthy.
    fn is_ready(&self) -> bool;
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    metrics: Arc<PrometheusMetricsSink>,
    readiness: Arc<Vec<Arc<dyn ReadinessCheck>>>,
}

impl ApiState {
    /// Build state over a metrics sink and the set of dependencies
    /// `/readyz` should poll.
    pub fn new(metrics: Arc<PrometheusMetricsSink>, readiness: Vec<Arc<dyn ReadinessCheck>>) -> Self {
        Self { metrics, readiness: Arc::new(readiness) }
    }
}

/// Build the router: `/healthz`, `/readyz`, `/metrics`, with request
/// tracing layered on top (the same `TraceLayer` + `ServiceBuilder`
/// shape used for this surface elsewhere in the stack).
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ApiState>) -> Response {
    let mut not_ready = Vec::new();
    for check in state.readiness.iter() {
        if !check.is_ready() {
            not_ready.push(check.name().to_string());
        }
    }
    if not_ready.is_empty() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, format!("not ready: {}", not_ready.join(", "))).into_response()
    }
}

async fn metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(error) => {
            tracing::error!(%error, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics").into_response()
        }
    }
}

/// The api layer's supervised service: binds a listener and serves the
/// router until cancelled.
pub struct ApiService {
    name: String,
    addr: SocketAddr,
    state: ApiState,
}

impl ApiService {
    /// A service bound to `addr`, serving `state`'s endpoints.
    pub fn new(addr: SocketAddr, state: ApiState) -> Self {
        Self { name: "api-http".to_string(), addr, state }
    }
}

#[async_trait]
impl Service for ApiService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<ServiceOutcome> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let router = build_router(self.state.clone());
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(ServiceOutcome::Stopped)
    }
}
