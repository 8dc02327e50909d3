use std::sync::Arc;

use axum::{extract::Extension, Json};
use tracing::{info, warn};

use auditrelay_core::AuditTarget;

use crate::app::dto::{AuditRequest, AuditResponse};
use crate::app::errors::ApiError;
use crate::app::services::{AppServices, HubSink};

/// POST /audit
///
/// Runs the whole pipeline before answering. Progress goes to
/// `/events/<correlationId>`; if the requested id was missing, blank or
/// already in use, the response carries the id that was used instead.
pub async fn submit_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<AuditRequest>,
) -> Result<Json<AuditResponse>, ApiError> {
    let target = AuditTarget::parse(&req.target)?;

    let job = services.jobs.claim(req.correlation_id.as_deref());
    let correlation_id = job.correlation_id().clone();
    if req.correlation_id.as_deref().map(str::trim) != Some(correlation_id.as_str()) {
        info!(requested = ?req.correlation_id, assigned = %correlation_id, "assigned correlation id");
    }

    let sink = HubSink::new(Arc::clone(&services.hub), correlation_id.clone());
    let outcome = services.runner.run(&target, &sink).await;
    drop(job);
    services.hub.prune(&correlation_id);

    match outcome {
        Ok(result) => Ok(Json(AuditResponse {
            correlation_id,
            result,
        })),
        Err(e) => {
            warn!(%correlation_id, error = %e, "audit failed");
            Err(e.into())
        }
    }
}
