use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use auditrelay_core::CorrelationId;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRequest {
    pub target: String,
    /// Raw so a blank or malformed id can be replaced rather than rejected.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    pub correlation_id: CorrelationId,
    pub result: JsonValue,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
