//! reqwest-backed [`Backend`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use auditrelay_core::CorrelationId;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::debug;

use crate::sse::SseDecoder;
use crate::transport::{Backend, FrameStream, HealthReport, SubmitRequest, SubmitResponse, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

/// Error body shape of the audit service.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
    agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn request_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Unreachable(err.to_string())
    }
}

async fn http_error(resp: reqwest::Response) -> TransportError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => TransportError::Http {
            status: status.as_u16(),
            code: body.error.unwrap_or_else(|| "http_error".to_string()),
            message: body.message.unwrap_or(text),
            agent: body.agent,
        },
        Err(_) => TransportError::Http {
            status: status.as_u16(),
            code: "http_error".to_string(),
            message: if text.is_empty() {
                status.to_string()
            } else {
                text
            },
            agent: None,
        },
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn check_health(&self, timeout: Duration) -> Result<HealthReport, TransportError> {
        let resp = self
            .client
            .get(self.url("/health"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let status = resp.status();
        let body = resp.json::<HealthBody>().await.ok();
        let reported = body.and_then(|b| b.status);
        let healthy = status.is_success()
            && reported
                .as_deref()
                .is_none_or(|s| matches!(s, "healthy" | "ok" | "ready"));

        Ok(HealthReport {
            status: status.as_u16(),
            healthy,
            detail: reported,
        })
    }

    async fn submit(
        &self,
        request: &SubmitRequest,
        timeout: Duration,
    ) -> Result<SubmitResponse, TransportError> {
        let resp = self
            .client
            .post(self.url("/audit"))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        if !resp.status().is_success() {
            return Err(http_error(resp).await);
        }

        resp.json::<SubmitResponse>().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Decode(e.to_string())
            }
        })
    }

    async fn open_stream(&self, correlation_id: &CorrelationId) -> Result<FrameStream, TransportError> {
        let url = self.url(&format!("/events/{correlation_id}"));
        debug!(%url, "opening progress channel");

        let resp = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(http_error(resp).await);
        }

        let bytes = Box::pin(resp.bytes_stream());
        let frames = futures_util::stream::unfold(
            (bytes, SseDecoder::new(), VecDeque::new(), false),
            |(mut bytes, mut decoder, mut pending, failed)| async move {
                loop {
                    if let Some(frame) = pending.pop_front() {
                        return Some((Ok(frame), (bytes, decoder, pending, failed)));
                    }
                    if failed {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            let err = TransportError::Unreachable(e.to_string());
                            return Some((Err(err), (bytes, decoder, pending, true)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(frames))
    }
}
