use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, Json};

use crate::app::dto::HealthResponse;
use crate::app::services::AppServices;

/// GET /health
pub async fn health(
    Extension(services): Extension<Arc<AppServices>>,
) -> (StatusCode, Json<HealthResponse>) {
    if services.is_warming_up() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "starting" }),
        )
    } else {
        (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
    }
}
