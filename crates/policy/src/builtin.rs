//! Built-in policies.

use async_trait::async_trait;
use llm::messages::{
    anthropic::{ContentBlock, ContentDelta, MessagesResponse, StreamEvent},
    openai::{ChatRequest, ChatResponse, ToolCall},
};
use serde::Deserialize;
use std::collections::BTreeSet;

use crate::{
    blocks::StreamBlock,
    context::{PolicyContext, StreamingPolicyContext},
    hooks::{AnthropicPolicy, Policy},
    simple::{Simple, SimplePolicy},
};

/// The identity policy: every request, chunk and response passes through
/// unchanged. The default active policy until something else is loaded.
pub struct NoOpPolicy;

#[async_trait]
impl Policy for NoOpPolicy {
    fn name(&self) -> &str {
        "noop"
    }
}

/// Example transformation policy: uppercases all response content.
///
/// Tool calls pass through unchanged. Mostly useful for demos and for
/// verifying swap isolation end to end.
pub struct UppercasePolicy;

#[async_trait]
impl SimplePolicy for UppercasePolicy {
    fn name(&self) -> &str {
        "uppercase"
    }

    async fn on_response_content(&self, content: String, _request: &ChatRequest) -> anyhow::Result<String> {
        Ok(content.to_uppercase())
    }
}

impl UppercasePolicy {
    /// The uppercase policy as a full [`Policy`].
    pub fn boxed() -> Simple<UppercasePolicy> {
        Simple::new(UppercasePolicy)
    }
}

/// Configuration for [`ToolFilterPolicy`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolFilterConfig {
    /// Names of tools whose calls are blocked.
    pub blocked_tools: BTreeSet<String>,
}

/// Blocks tool calls whose name is on a configured blocklist.
///
/// Blocked calls never reach the client; a notice text is sent instead and
/// the finish reason is rewritten to `stop` when no call survives.
pub struct ToolFilterPolicy {
    blocked_tools: BTreeSet<String>,
}

impl ToolFilterPolicy {
    /// Build from configuration.
    pub fn new(config: ToolFilterConfig) -> Self {
        log::info!(
            "Tool filter active, blocking: [{}]",
            config
                .blocked_tools
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self {
            blocked_tools: config.blocked_tools,
        }
    }

    /// The tool filter as a full [`Policy`].
    pub fn boxed(config: ToolFilterConfig) -> Simple<ToolFilterPolicy> {
        Simple::new(Self::new(config))
    }
}

#[async_trait]
impl SimplePolicy for ToolFilterPolicy {
    fn name(&self) -> &str {
        "tool-filter"
    }

    async fn on_response_tool_call(
        &self,
        tool_call: ToolCall,
        _request: &ChatRequest,
    ) -> anyhow::Result<Option<ToolCall>> {
        if self.blocked_tools.contains(&tool_call.function.name) {
            log::warn!(
                "Blocked tool call '{}' (id={})",
                tool_call.function.name,
                tool_call.id
            );
            return Ok(None);
        }

        Ok(Some(tool_call))
    }
}

/// Logs every hook invocation at debug level and passes everything
/// through. Useful for tracing what a transaction looks like from the
/// policy's point of view.
pub struct DebugLoggingPolicy;

#[async_trait]
impl Policy for DebugLoggingPolicy {
    fn name(&self) -> &str {
        "debug-logging"
    }

    async fn on_request(&self, request: ChatRequest, ctx: &mut PolicyContext) -> anyhow::Result<ChatRequest> {
        log::debug!(
            "[{}] on_request: model={} messages={}",
            ctx.transaction_id,
            request.model,
            request.messages.len()
        );
        Ok(request)
    }

    async fn on_response(&self, response: ChatResponse, ctx: &mut PolicyContext) -> anyhow::Result<ChatResponse> {
        log::debug!(
            "[{}] on_response: id={} choices={}",
            ctx.transaction_id,
            response.id,
            response.choices.len()
        );
        Ok(response)
    }

    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        log::debug!(
            "[{}] on_chunk_received: chunk #{}",
            ctx.transaction_id,
            ctx.state().raw_chunks().len()
        );
        ctx.passthrough_last_chunk().await?;
        Ok(())
    }

    async fn on_content_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let length = ctx
            .state()
            .just_completed()
            .and_then(StreamBlock::content)
            .map_or(0, str::len);
        log::debug!("[{}] on_content_complete: {length} chars", ctx.transaction_id);
        Ok(())
    }

    async fn on_tool_call_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        if let Some(call) = ctx.state().just_completed().and_then(StreamBlock::tool_call) {
            log::debug!(
                "[{}] on_tool_call_complete: {} ({} argument bytes)",
                ctx.transaction_id,
                call.function.name,
                call.function.arguments.len()
            );
        }
        Ok(())
    }

    async fn on_stream_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        log::debug!(
            "[{}] on_stream_complete: {} blocks, finish_reason={:?}",
            ctx.transaction_id,
            ctx.state().blocks().len(),
            ctx.state().finish_reason()
        );
        Ok(())
    }
}

/// Records the accumulated response text into the stream context store,
/// keyed by transaction id, while passing everything through.
///
/// Other components (or composed policies) can read the transcript with
/// `get_accumulated`/`get_index` while the stream is still in flight.
pub struct TranscriptRecorderPolicy;

#[async_trait]
impl Policy for TranscriptRecorderPolicy {
    fn name(&self) -> &str {
        "transcript-recorder"
    }

    async fn on_content_delta(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let Some(store) = ctx.store() else {
            return Ok(());
        };

        let delta = ctx
            .state()
            .last_chunk()
            .and_then(|chunk| chunk.primary_delta())
            .and_then(|delta| delta.content.clone())
            .unwrap_or_default();

        store.append_delta(&ctx.transaction_id, &delta).await?;
        Ok(())
    }
}

/// Example of the native Anthropic hook set: uppercases text on the
/// `/v1/messages` surface without protocol conversion in between.
///
/// Non-streaming responses have their text blocks rewritten; streaming
/// responses have each `text_delta` rewritten on the fly.
pub struct AnthropicUppercasePolicy;

#[async_trait]
impl Policy for AnthropicUppercasePolicy {
    fn name(&self) -> &str {
        "anthropic-uppercase"
    }

    fn as_anthropic(&self) -> Option<&dyn AnthropicPolicy> {
        Some(self)
    }
}

#[async_trait]
impl AnthropicPolicy for AnthropicUppercasePolicy {
    async fn on_messages_response(
        &self,
        mut response: MessagesResponse,
        _ctx: &mut PolicyContext,
    ) -> anyhow::Result<MessagesResponse> {
        for block in &mut response.content {
            if let ContentBlock::Text { text } = block {
                *text = text.to_uppercase();
            }
        }
        Ok(response)
    }

    async fn on_stream_event(
        &self,
        event: StreamEvent,
        _ctx: &mut PolicyContext,
    ) -> anyhow::Result<Option<StreamEvent>> {
        let event = match event {
            StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::TextDelta { text },
            } => StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::TextDelta {
                    text: text.to_uppercase(),
                },
            },
            other => other,
        };

        Ok(Some(event))
    }
}
