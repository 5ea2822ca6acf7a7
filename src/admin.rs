//! Admin HTTP surface: liveness and Prometheus metrics.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::service::ExtProcessor;

/// Build the admin router. The router holds a clone of the processor,
/// which shares the metrics of the one serving gRPC.
pub fn router(processor: ExtProcessor) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(processor)
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(processor): State<ExtProcessor>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "filterCount": processor.filter_count(),
        "streamFilterCount": processor.stream_filter_count(),
        "activeStreams": processor.metrics().streams_active(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

async fn metrics_handler(State(processor): State<ExtProcessor>) -> axum::response::Response {
    let body = processor.metrics().render_prometheus();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}
