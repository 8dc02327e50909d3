use axum::{
    routing::{get, post},
    Router,
};

pub mod audit;
pub mod events;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/audit", post(audit::submit_audit))
        .route("/events/:correlation_id", get(events::stream_events))
}
