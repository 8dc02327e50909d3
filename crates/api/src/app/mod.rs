//! HTTP API application wiring (Axum router + service wiring).
//!
//! If you're new to this crate, this folder is structured like:
//! - `services.rs`: the progress hub, in-flight job ids and the pipeline runner
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use auditrelay_pipeline::Analyzer;
use axum::http::{header, HeaderValue, Method};
use axum::{Extension, Router};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router with the offline analyzer (used by `main.rs`).
pub fn build_app(config: ServerConfig) -> Router {
    let services = Arc::new(services::build_services(&config));
    assemble(services, &config)
}

/// Same router, with the stage bodies supplied by `analyzer`.
pub fn build_app_with(config: ServerConfig, analyzer: Arc<dyn Analyzer>) -> Router {
    let services = Arc::new(services::build_services_with(&config, analyzer));
    assemble(services, &config)
}

fn assemble(services: Arc<services::AppServices>, config: &ServerConfig) -> Router {
    routes::router()
        .layer(Extension(services))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors(config)),
        )
}

fn cors(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE])
}
