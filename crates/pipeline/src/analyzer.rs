//! Stage bodies (external collaborator boundary).

use async_trait::async_trait;
use auditrelay_core::AuditTarget;
use serde_json::{Map, Value as JsonValue, json};

use crate::upstream::UpstreamError;

/// Input handed to a stage: the target plus the outputs of earlier stages.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub target: AuditTarget,
    pub prior: Map<String, JsonValue>,
}

impl StageInput {
    pub fn prior_output(&self, stage: &str) -> Option<&JsonValue> {
        self.prior.get(stage)
    }
}

/// Performs the analysis behind one named stage.
///
/// Implementations report upstream failures as [`UpstreamError`]; use
/// [`UpstreamError::classify`] on raw provider messages.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn run_stage(&self, stage: &str, input: &StageInput) -> Result<JsonValue, UpstreamError>;
}

/// Deterministic analyzer with no upstream calls.
///
/// Backs the server binary when no model provider is wired in, so the
/// protocol can be exercised end to end.
#[derive(Debug, Clone, Default)]
pub struct OfflineAnalyzer;

#[async_trait]
impl Analyzer for OfflineAnalyzer {
    async fn run_stage(&self, stage: &str, input: &StageInput) -> Result<JsonValue, UpstreamError> {
        let target = input.target.as_str();
        let host = host_of(target);

        let output = match stage {
            "page-inspection" => json!({
                "target": target,
                "primary_keyword": host.split('.').next().unwrap_or(host),
                "technical_findings": [],
            }),
            "comparative-analysis" => {
                let keyword = input
                    .prior_output("page-inspection")
                    .and_then(|p| p.get("primary_keyword"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or(host);
                json!({ "keyword": keyword, "results": [], "insights": [] })
            }
            "recommendation-generation" => json!({
                "report": format!("# Audit Report\n\nTarget: {target}\n\nNo findings (offline analyzer).\n"),
            }),
            other => json!({ "stage": other, "target": target }),
        };

        Ok(output)
    }
}

fn host_of(target: &str) -> &str {
    let rest = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_analyzer_threads_keyword_through() {
        let analyzer = OfflineAnalyzer;
        let mut input = StageInput {
            target: AuditTarget::parse("https://shop.example.com/shoes").unwrap(),
            prior: Map::new(),
        };

        let page = analyzer.run_stage("page-inspection", &input).await.unwrap();
        assert_eq!(page["primary_keyword"], "shop");

        input.prior.insert("page-inspection".into(), page);
        let serp = analyzer.run_stage("comparative-analysis", &input).await.unwrap();
        assert_eq!(serp["keyword"], "shop");
    }
}
