//! The upstream provider abstraction.

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::{Client, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::LlmError,
    messages::openai::{ChatChunk, ChatRequest, ChatResponse},
};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// A stream of normalized provider chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = crate::Result<ChatChunk>> + Send>>;

/// Thin interface hiding the concrete provider call.
///
/// Both methods accept the internal OpenAI-shaped request. Implementations
/// handle provider-prefix normalization and credential injection.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Execute a non-streaming completion.
    async fn complete(&self, request: ChatRequest) -> crate::Result<ChatResponse>;

    /// Open a streaming completion.
    async fn stream(&self, request: ChatRequest) -> crate::Result<ChunkStream>;
}

/// Prepend `openai/` to recognized OpenAI-family model names lacking a
/// provider prefix. Other names pass through untouched.
pub fn ensure_provider_prefix(model: &str) -> String {
    if model.contains('/') {
        return model.to_string();
    }

    let openai_family = ["gpt-", "chatgpt-", "o1", "o3", "o4"];
    if openai_family.iter().any(|prefix| model.starts_with(prefix)) {
        return format!("openai/{model}");
    }

    model.to_string()
}

fn strip_provider_prefix(model: &str) -> &str {
    model.split_once('/').map(|(_, name)| name).unwrap_or(model)
}

/// `LlmClient` for OpenAI-compatible HTTP APIs.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl OpenAiClient {
    /// Build a client from the upstream configuration.
    pub fn new(config: &config::LlmConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_string()),
            api_key: config.api_key.clone(),
            timeout: config.upstream_timeout,
        }
    }

    fn prepare(&self, mut request: ChatRequest, stream: bool) -> ChatRequest {
        request.model = strip_provider_prefix(&ensure_provider_prefix(&request.model)).to_string();
        request.stream = Some(stream);
        request
    }

    async fn send(&self, request: &ChatRequest) -> crate::Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut builder = self.client.post(&url).header("Content-Type", "application/json");

        // A whole-request timeout would cut long SSE streams short; it
        // only applies to non-streaming calls. Streams are guarded by the
        // orchestrator's stall monitor instead.
        if !request.stream.unwrap_or(false) {
            builder = builder.timeout(self.timeout);
        }

        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()));
        }

        let response = builder.json(request).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::UpstreamTimeout(self.timeout.as_secs())
            } else {
                LlmError::ConnectionError(format!("Failed to send request to upstream: {e}"))
            }
        })?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Upstream API error ({status}): {error_text}");

            return Err(match status.as_u16() {
                400 => LlmError::InvalidRequest(error_text),
                401 => LlmError::AuthenticationFailed(error_text),
                404 => LlmError::ModelNotFound(error_text),
                429 => LlmError::RateLimitExceeded { message: error_text },
                500 => LlmError::InternalError(Some(error_text)),
                _ => LlmError::ProviderApiError {
                    status: status.as_u16(),
                    message: error_text,
                },
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> crate::Result<ChatResponse> {
        let request = self.prepare(request, false);
        let response = self.send(&request).await?;

        let response_text = response.text().await.map_err(|e| {
            log::error!("Failed to read upstream response body: {e}");
            LlmError::InternalError(None)
        })?;

        let chat_response: ChatResponse = serde_json::from_str(&response_text).map_err(|e| {
            log::error!("Failed to parse upstream chat completion response: {e}");
            log::debug!("Response parsing failed, length: {} bytes", response_text.len());

            LlmError::InternalError(None)
        })?;

        Ok(chat_response)
    }

    async fn stream(&self, request: ChatRequest) -> crate::Result<ChunkStream> {
        let request = self.prepare(request, true);
        let response = self.send(&request).await?;

        let event_stream = response.bytes_stream().eventsource();

        // Parsing into ChatChunk is the normalization step: deltas become
        // structured values and finish_reason survives verbatim.
        let chunk_stream = event_stream.filter_map(|event| async move {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("SSE parsing error in upstream stream: {e}");
                    return None;
                }
            };

            if event.data == "[DONE]" {
                return None;
            }

            match serde_json::from_str::<ChatChunk>(&event.data) {
                Ok(chunk) => Some(Ok(chunk)),
                Err(e) => {
                    log::warn!("Failed to parse upstream streaming chunk: {e}");
                    None
                }
            }
        });

        Ok(Box::pin(chunk_stream))
    }
}
