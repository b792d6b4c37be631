//! HTTP server for the Prometheus metrics and health endpoints.

use crate::election::{ElectedServer, Role};
use crate::metrics::MetricsRegistry;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    registry: Arc<MetricsRegistry>,
    server: Arc<ElectedServer>,
}

/// Body of `GET /healthz`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub role: String,
    pub scheduler_leader: Option<String>,
    pub sink_healthy: bool,
    pub workers: usize,
}

/// Serves `/metrics` and `/healthz`
pub struct MetricsServer {
    registry: Arc<MetricsRegistry>,
    server: Arc<ElectedServer>,
    listen_addr: String,
}

impl MetricsServer {
    pub fn new(
        registry: Arc<MetricsRegistry>,
        server: Arc<ElectedServer>,
        listen_addr: String,
    ) -> Self {
        Self {
            registry,
            server,
            listen_addr,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(health_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(AppState {
                registry: self.registry.clone(),
                server: self.server.clone(),
            })
    }

    /// Serve until `scope` is cancelled
    pub async fn run(self, scope: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.router();
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Metrics server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { scope.cancelled().await })
            .await?;

        info!("Metrics server stopped");
        Ok(())
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state.registry.registry) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

/// 503 while master without a scheduler to report to
async fn health_handler(State(state): State<AppState>) -> Response {
    let role = state.server.role();
    let sink = state.server.sink();
    let report = HealthReport {
        role: role.to_string(),
        scheduler_leader: sink.leader(),
        sink_healthy: sink.is_healthy(),
        workers: state.server.dispatcher().map_or(0, |d| d.len()),
    };

    let status = if role == Role::Master && !report.sink_healthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}
