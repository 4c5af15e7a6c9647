//! Prometheus metrics exposition
//!
//! - `httpbin_requests_total` (counter): labels `endpoint`, `status`
//! - `httpbin_request_duration_seconds` (histogram): label `endpoint`
//! - `httpbin_retry_remaining` (gauge): current fault counter value
//!
//! Metrics are served from a separate listener (`--metrics-addr`) so the main
//! listener exposes only the diagnostic endpoints.

use std::time::Instant;

use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::{Instrument, info_span};

const DURATION_METRIC: &str = "httpbin_request_duration_seconds";

/// Buckets from 5ms to 5 minutes; `/timeout` holds requests open for as
/// long as the caller asks.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed request on one of the diagnostic endpoints.
pub fn record_request(endpoint: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "httpbin_requests_total",
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(DURATION_METRIC, "endpoint" => endpoint.to_string())
        .record(duration_secs);
}

/// Publish the fault counter value left after the latest `/retry` call.
pub fn set_retry_remaining(remaining: u32) {
    metrics::gauge!("httpbin_retry_remaining").set(f64::from(remaining));
}

/// Route-layer middleware: opens a request span with a fresh request id and
/// records status and latency per matched endpoint.
pub async fn track_request(matched: MatchedPath, request: Request, next: Next) -> Response {
    let endpoint = matched.as_str().to_owned();
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        endpoint = %endpoint,
    );

    let started = Instant::now();
    let response = next.run(request).instrument(span).await;
    record_request(
        &endpoint,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Router for the metrics listener.
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle)
}

/// Prometheus text exposition format.
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
