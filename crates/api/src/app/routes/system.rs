use axum::http::{StatusCode, header};
use axum::response::IntoResponse;

use crate::app::errors::json_error;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /metrics
///
/// Prometheus text exposition.
pub async fn metrics() -> axum::response::Response {
    match datlake_observability::metrics::prometheus_handle() {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics_unavailable",
            "metrics recorder not installed",
        ),
    }
}
