//! Scheduler extender HTTP server
//!
//! Serves the `filter` verb for kube-scheduler plus health and metrics
//! endpoints. Every replica serves, leader or not.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use opentelemetry::{global, propagation::Extractor};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::extender::{ExtenderArgs, ExtenderFilterResult};
use super::gate::AdmissionGate;
use crate::controller::WorkloadRecord;
use crate::error::{Error, Result};

struct HeaderExtractor<'a>(&'a HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v: &HeaderValue| v.to_str().ok())
    }
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k: &HeaderName| k.as_str()).collect()
    }
}

/// Join the scheduler's trace when it propagates one
async fn extract_trace_context(request: Request, next: Next) -> Response {
    let parent_cx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(request.headers()))
    });
    tracing::Span::current().set_parent(parent_cx);
    next.run(request).await
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Build the extender router around an admission gate
pub fn router(gate: Arc<AdmissionGate>) -> Router {
    let router = Router::new()
        .route("/filter", post(filter_handler))
        .route("/healthz", get(health_handler));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(middleware::from_fn(extract_trace_context))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(gate)
}

/// Serve the extender on `addr` until `shutdown` flips to true
pub async fn serve(
    addr: SocketAddr,
    gate: Arc<AdmissionGate>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(gate);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ServerError(format!("Failed to bind to {addr}: {e}")))?;

    info!("Scheduler extender listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Scheduler extender shutting down");
        })
        .await
        .map_err(|e| Error::ServerError(format!("Server error: {e}")))?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> Response {
    match crate::controller::metrics::render() {
        Ok(body) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

/// The scheduler always gets a 200 with a filter result; problems with the
/// request go in the `error` field, which fails the scheduling attempt.
#[instrument(skip(gate, body))]
async fn filter_handler(
    State(gate): State<Arc<AdmissionGate>>,
    body: std::result::Result<Json<ExtenderArgs>, JsonRejection>,
) -> (StatusCode, Json<ExtenderFilterResult>) {
    let args = match body {
        Ok(Json(args)) => args,
        Err(e) => {
            warn!("Rejecting malformed filter request: {}", e.body_text());
            return (
                StatusCode::OK,
                Json(ExtenderFilterResult::error(format!(
                    "invalid extender request: {}",
                    e.body_text()
                ))),
            );
        }
    };

    let workload = WorkloadRecord::from_pod(&args.pod);
    let decision = gate.admit(&workload).await;

    info!(
        workload = %workload,
        decision = decision.label(),
        candidates = args.candidate_names().len(),
        "Filter request answered"
    );

    (
        StatusCode::OK,
        Json(ExtenderFilterResult::from_decision(&args, &decision)),
    )
}
