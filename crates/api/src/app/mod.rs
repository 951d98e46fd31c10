//! HTTP API application wiring (Axum router + runtime wiring).
//!
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `transport.rs`: the SSE body a session's delivery loop writes into
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use datlake_infra::CoreRuntime;

pub mod errors;
pub mod routes;
pub mod transport;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(runtime: Arc<CoreRuntime>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/metrics", get(routes::system::metrics))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(runtime)))
}
