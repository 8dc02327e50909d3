use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::{IntoResponse, Response},
};
use axum::http::StatusCode;

use auditrelay_core::CorrelationId;

use crate::app::errors::json_error;
use crate::app::services::{self, AppServices};

/// GET /events/:correlation_id
///
/// Server-sent events for one job: a `connected` frame, then every pipeline
/// event published under the id. Subscribing before submission is what
/// guarantees early events are seen; nothing is replayed.
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw_id): Path<String>,
) -> Response {
    let correlation_id: CorrelationId = match raw_id.parse() {
        Ok(id) => id,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_correlation_id", e.to_string());
        }
    };

    services::progress_sse_stream(Arc::clone(&services.hub), correlation_id).into_response()
}
