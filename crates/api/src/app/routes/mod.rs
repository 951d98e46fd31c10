use axum::Router;

pub mod admin;
pub mod stream;
pub mod system;

/// Router for the event stream and admin endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/events", stream::router())
        .nest("/admin", admin::router())
}
