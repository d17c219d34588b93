//! Upstream completion API used to produce summaries.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use paygate::CORRELATION_ID_HEADER;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::metrics::UPSTREAM_LATENCY;
use crate::probe::ProbeStatus;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("invalid response from AI provider: {0}")]
    Decode(String),
}

impl From<UpstreamError> for GatewayError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Timeout => GatewayError::UpstreamTimeout,
            other => GatewayError::UpstreamFailed(other.to_string()),
        }
    }
}

/// A model that turns text into a short summary.
pub trait Summarizer: Send + Sync {
    /// Model identifier; part of every cache key.
    fn model(&self) -> &str;

    fn summarize<'a>(
        &'a self,
        text: &'a str,
        correlation_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, UpstreamError>>;

    fn probe(&self) -> BoxFuture<'_, ProbeStatus>;
}

pub fn summary_prompt(text: &str) -> String {
    format!("Summarize this text in 2 sentences: {text}")
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Pull `choices[0].message.content` out of a chat-completions body.
fn extract_summary(body: &[u8]) -> Result<String, UpstreamError> {
    let parsed: ChatResponse =
        serde_json::from_slice(body).map_err(|e| UpstreamError::Decode(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| UpstreamError::Decode("no choices".to_string()))?;
    choice
        .message
        .ok_or_else(|| UpstreamError::Decode("malformed message".to_string()))?
        .content
        .ok_or_else(|| UpstreamError::Decode("missing content".to_string()))
}

/// OpenRouter-compatible chat completions client.
pub struct OpenRouterClient {
    client: reqwest::Client,
    url: String,
    /// `{origin}/api/v1/models`, probed by `/readyz`.
    models_url: Option<String>,
    api_key: String,
    model: String,
    probe_timeout: Duration,
}

impl OpenRouterClient {
    pub fn new(
        client: reqwest::Client,
        url: &str,
        api_key: &str,
        model: &str,
        probe_timeout: Duration,
    ) -> Self {
        let models_url = url::Url::parse(url)
            .ok()
            .and_then(|u| u.join("/api/v1/models").ok())
            .map(|u| u.to_string());
        Self {
            client,
            url: url.to_string(),
            models_url,
            api_key: api_key.to_string(),
            model: model.to_string(),
            probe_timeout,
        }
    }

    async fn complete(&self, text: &str, correlation_id: Option<&str>) -> Result<String, UpstreamError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": summary_prompt(text) }],
        });

        let mut builder = self.client.post(&self.url).bearer_auth(&self.api_key).json(&body);
        if let Some(cid) = correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, cid);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        UPSTREAM_LATENCY.observe(started.elapsed().as_secs_f64());

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), correlation_id, "upstream returned error status");
            return Err(UpstreamError::Status(status.as_u16()));
        }
        extract_summary(&bytes)
    }
}

impl Summarizer for OpenRouterClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn summarize<'a>(
        &'a self,
        text: &'a str,
        correlation_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, UpstreamError>> {
        Box::pin(self.complete(text, correlation_id))
    }

    fn probe(&self) -> BoxFuture<'_, ProbeStatus> {
        Box::pin(async move {
            let Some(ref models_url) = self.models_url else {
                return ProbeStatus::Unconfigured;
            };
            if self.api_key.is_empty() {
                return ProbeStatus::Unconfigured;
            }
            match self
                .client
                .get(models_url)
                .bearer_auth(&self.api_key)
                .timeout(self.probe_timeout)
                .send()
                .await
            {
                Ok(resp) => ProbeStatus::from_status(resp.status()),
                Err(e) => {
                    tracing::debug!(error = %e, "upstream health probe failed");
                    ProbeStatus::Unreachable
                }
            }
        })
    }
}
